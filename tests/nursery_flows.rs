mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use tokio::sync::broadcast;

use support::mocks::{MockChainClient, MockLightningClient, MockWallet, RecordingClaimer};
use swap_nursery::chain::watcher::UtxoChainWatcher;
use swap_nursery::chain::{AcceptingTransactionHook, ChainSourceEvent, OverpaymentProtector};
use swap_nursery::currency::{Currency, CurrencyMap, CurrencyType};
use swap_nursery::lightning::InvoiceState;
use swap_nursery::nursery::claim::DeferredClaimer;
use swap_nursery::nursery::events::{ChainSwapEvent, NurseryEvent, ObservedLockup, ReverseSwapEvent};
use swap_nursery::nursery::payment::NodeSwitch;
use swap_nursery::nursery::SwapNursery;
use swap_nursery::swap::store::SqliteStore;
use swap_nursery::swap::{
    ChainSwap, ChainSwapLeg, OrderSide, ReverseSwap, Submarine, SwapUpdateEvent, SwapVersion,
};
use swap_nursery::utxo::{pubkey_hash160, sha256_preimage, SwapScript};
use swap_nursery::NurseryConfig;

#[allow(dead_code)]
struct Harness {
    nursery: SwapNursery,
    store: Arc<Mutex<SqliteStore>>,
    btc_chain: Arc<MockChainClient>,
    btc_wallet: Arc<MockWallet>,
    btc_watcher: Arc<UtxoChainWatcher>,
    ltc_chain: Arc<MockChainClient>,
    ltc_wallet: Arc<MockWallet>,
    ltc_watcher: Arc<UtxoChainWatcher>,
    ln: Arc<MockLightningClient>,
    events: broadcast::Receiver<NurseryEvent>,
}

fn harness(claimer: Option<Arc<dyn DeferredClaimer>>) -> Harness {
    let _ = swap_nursery::logging::init();

    let store = Arc::new(Mutex::new(
        SqliteStore::open_in_memory().expect("open sqlite"),
    ));

    let btc_chain = MockChainClient::new("BTC");
    let btc_wallet = MockWallet::new("BTC", btc_chain.clone());
    let ltc_chain = MockChainClient::new("LTC");
    let ltc_wallet = MockWallet::new("LTC", ltc_chain.clone());
    let ln = MockLightningClient::new("node-a", "BTC");

    let currencies = CurrencyMap::new([
        Currency::utxo(
            "BTC",
            CurrencyType::BitcoinLike,
            btc_chain.clone(),
            btc_wallet.clone(),
        )
        .with_lightning(ln.clone()),
        Currency::utxo(
            "LTC",
            CurrencyType::BitcoinLike,
            ltc_chain.clone(),
            ltc_wallet.clone(),
        ),
    ]);

    let config = NurseryConfig {
        retry_interval_secs: 0,
        lightning_client_call_timeout_ms: 1_000,
        event_queue_depth: 100,
        ..NurseryConfig::default()
    };

    let nursery = SwapNursery::new(
        config,
        currencies,
        store.clone(),
        NodeSwitch::default(),
        None,
        claimer,
        None,
    );

    let btc_watcher = UtxoChainWatcher::new(
        btc_chain.clone(),
        Arc::new(AcceptingTransactionHook),
        OverpaymentProtector::default(),
        nursery.submarine_sender(),
        nursery.reverse_sender(),
        nursery.chain_sender(),
    );
    let ltc_watcher = UtxoChainWatcher::new(
        ltc_chain.clone(),
        Arc::new(AcceptingTransactionHook),
        OverpaymentProtector::default(),
        nursery.submarine_sender(),
        nursery.reverse_sender(),
        nursery.chain_sender(),
    );
    nursery.register_chain_watcher(btc_watcher.clone());
    nursery.register_chain_watcher(ltc_watcher.clone());

    let events = nursery.subscribe();
    nursery.start();
    btc_watcher.spawn();
    ltc_watcher.spawn();

    Harness {
        nursery,
        store,
        btc_chain,
        btc_wallet,
        btc_watcher,
        ltc_chain,
        ltc_wallet,
        ltc_watcher,
        ln,
        events,
    }
}

async fn next_event(events: &mut broadcast::Receiver<NurseryEvent>) -> NurseryEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for nursery event")
        .expect("event stream closed")
}

async fn wait_for<F>(events: &mut broadcast::Receiver<NurseryEvent>, mut matches: F) -> NurseryEvent
where
    F: FnMut(&NurseryEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

fn swap_script(preimage_hash: [u8; 32], claim_keys: &bitcoin::secp256k1::Keypair) -> SwapScript {
    SwapScript {
        preimage_hash,
        claim_pubkey_hash160: pubkey_hash160(&claim_keys.public_key().serialize()),
        refund_pubkey_hash160: [0x11; 20],
        timeout_block_height: 800_000,
    }
}

fn submarine_template(id: &str, preimage_hash: [u8; 32], script: &SwapScript) -> Submarine {
    Submarine {
        id: id.to_string(),
        pair: "BTC/BTC".to_string(),
        order_side: OrderSide::Buy,
        version: SwapVersion::Legacy,
        invoice: None,
        preimage_hash: hex::encode(preimage_hash),
        lockup_address: hex::encode(script.script_pubkey().as_bytes()),
        timeout_block_height: 800_000,
        expected_amount: 100_000,
        onchain_amount: 0,
        lockup_transaction_id: None,
        lockup_transaction_vout: None,
        key_index: 0,
        redeem_script: Some(hex::encode(script.witness_script().as_bytes())),
        their_public_key: None,
        rate: None,
        status: SwapUpdateEvent::SwapCreated,
        miner_fee: None,
    }
}

fn reverse_template(
    id: &str,
    preimage_hash: [u8; 32],
    script: &SwapScript,
    timeout_block_height: u64,
) -> ReverseSwap {
    ReverseSwap {
        id: id.to_string(),
        pair: "BTC/BTC".to_string(),
        order_side: OrderSide::Buy,
        version: SwapVersion::Legacy,
        invoice: format!("invoice-{id}"),
        preimage_hash: hex::encode(preimage_hash),
        lockup_address: hex::encode(script.script_pubkey().as_bytes()),
        timeout_block_height,
        onchain_amount: 50_000,
        claim_address: None,
        miner_fee_invoice: None,
        miner_fee_invoice_preimage: None,
        minerfee_onchain_amount: None,
        transaction_id: None,
        transaction_vout: None,
        key_index: 0,
        redeem_script: Some(hex::encode(script.witness_script().as_bytes())),
        their_public_key: None,
        lightning_currency: "BTC".to_string(),
        node: "node-a".to_string(),
        status: SwapUpdateEvent::SwapCreated,
        miner_fee: None,
    }
}

/// A transaction paying `value` to `script`, unique per `salt`.
fn lockup_transaction(script: &ScriptBuf, value: u64, salt: u8) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([salt; 32]),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script.clone(),
        }],
    }
}

/// A spend of `lockup_txid` whose witness reveals `preimage`.
fn claim_spend(lockup_txid: Txid, preimage: [u8; 32]) -> Transaction {
    let mut witness = Witness::new();
    witness.push([0xde, 0xad]);
    witness.push(preimage);
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: lockup_txid,
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness,
        }],
        output: vec![TxOut {
            value: Amount::from_sat(49_000),
            script_pubkey: MockWallet::receive_script(),
        }],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submarine_lockup_pays_invoice_and_claims() {
    let mut h = harness(None);

    let preimage = [9u8; 32];
    let preimage_hash = sha256_preimage(&preimage);
    let claim_keys = h.btc_wallet.get_keys(0);
    let script = swap_script(preimage_hash, &claim_keys);

    let mut swap = submarine_template("s1", preimage_hash, &script);
    swap.invoice = Some("invoice-s1".to_string());
    h.store.lock().unwrap().insert_swap(&swap).unwrap();
    h.ln.expect_payment("invoice-s1", preimage);

    h.btc_watcher
        .watch_user_lockup("s1", swap_nursery::SwapKind::Submarine, script.script_pubkey(), 100_000, 800_000);

    let lockup_tx = lockup_transaction(&script.script_pubkey(), 100_000, 1);
    h.btc_chain.insert_transaction(&lockup_tx);
    h.btc_chain.push_event(ChainSourceEvent::Transaction {
        tx: lockup_tx.clone(),
        confirmed: true,
    });

    let event = wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::Transaction { id, .. } if id == "s1")
    })
    .await;
    match event {
        NurseryEvent::Transaction { confirmed, transaction_id, .. } => {
            assert!(confirmed);
            assert_eq!(transaction_id, lockup_tx.compute_txid().to_string());
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let claim = wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::Claim { id, .. } if id == "s1")
    })
    .await;
    let NurseryEvent::Claim { transaction_id, .. } = claim else {
        unreachable!();
    };

    assert_eq!(h.ln.paid.lock().unwrap().as_slice(), ["invoice-s1"]);

    let stored = h.store.lock().unwrap().get_swap("s1").unwrap().unwrap();
    assert_eq!(stored.status, SwapUpdateEvent::TransactionClaimed);
    assert!(stored.miner_fee.is_some());
    assert_eq!(
        stored.lockup_transaction_id.as_deref(),
        Some(lockup_tx.compute_txid().to_string().as_str())
    );

    // The broadcast claim spends the lockup and reveals the preimage.
    let claim_tx = h.btc_chain.last_broadcast().expect("claim broadcast");
    assert_eq!(claim_tx.compute_txid().to_string(), transaction_id);
    assert_eq!(
        claim_tx.input[0].previous_output.txid,
        lockup_tx.compute_txid()
    );
    assert_eq!(
        swap_nursery::utxo::extract_preimage(&claim_tx.input[0], &preimage_hash),
        Some(preimage)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reverse_swap_locks_up_and_settles_on_claim() {
    let mut h = harness(None);

    let preimage = [21u8; 32];
    let preimage_hash = sha256_preimage(&preimage);
    let keys = h.btc_wallet.get_keys(0);
    let script = swap_script(preimage_hash, &keys);

    let swap = reverse_template("r1", preimage_hash, &script, 850_000);
    h.store.lock().unwrap().insert_reverse_swap(&swap).unwrap();

    h.nursery
        .reverse_sender()
        .send(ReverseSwapEvent::InvoicePaid {
            id: "r1".to_string(),
        })
        .await
        .unwrap();

    let sent = wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::CoinsSent { id, .. } if id == "r1")
    })
    .await;
    let NurseryEvent::CoinsSent { transaction_id, .. } = sent else {
        unreachable!();
    };

    let stored = h
        .store
        .lock()
        .unwrap()
        .get_reverse_swap("r1")
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SwapUpdateEvent::TransactionMempool);
    assert_eq!(stored.transaction_id.as_deref(), Some(transaction_id.as_str()));
    assert_eq!(h.btc_wallet.sent_count(), 1);

    // The user claims the lockup, revealing the preimage.
    let lockup_txid: Txid = transaction_id.parse().unwrap();
    h.btc_chain.push_event(ChainSourceEvent::Transaction {
        tx: claim_spend(lockup_txid, preimage),
        confirmed: true,
    });

    wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::InvoiceSettled { id } if id == "r1")
    })
    .await;

    assert_eq!(h.ln.settled.lock().unwrap().as_slice(), [preimage]);
    let stored = h
        .store
        .lock()
        .unwrap()
        .get_reverse_swap("r1")
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SwapUpdateEvent::InvoiceSettled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reverse_swap_expiry_refunds_server_lockup() {
    let mut h = harness(None);

    let preimage = [33u8; 32];
    let preimage_hash = sha256_preimage(&preimage);
    let keys = h.btc_wallet.get_keys(0);
    let mut script = swap_script(preimage_hash, &keys);
    script.refund_pubkey_hash160 = pubkey_hash160(&keys.public_key().serialize());
    script.timeout_block_height = 850_000;

    let swap = reverse_template("r2", preimage_hash, &script, 850_000);
    h.store.lock().unwrap().insert_reverse_swap(&swap).unwrap();
    h.ln.set_invoice_state(preimage_hash, InvoiceState::Accepted);

    h.nursery
        .reverse_sender()
        .send(ReverseSwapEvent::InvoicePaid {
            id: "r2".to_string(),
        })
        .await
        .unwrap();
    wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::CoinsSent { id, .. } if id == "r2")
    })
    .await;

    // The HTLC times out before the user claims.
    h.btc_chain
        .push_event(ChainSourceEvent::Block { height: 850_000 });

    let refund = wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::Refund { id, .. } if id == "r2")
    })
    .await;
    let NurseryEvent::Refund { transaction_id, .. } = refund else {
        unreachable!();
    };

    let stored = h
        .store
        .lock()
        .unwrap()
        .get_reverse_swap("r2")
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SwapUpdateEvent::TransactionRefunded);

    // Refund spends with locktime at the HTLC timeout and is persisted.
    let refund_tx = h.btc_chain.last_broadcast().expect("refund broadcast");
    assert_eq!(refund_tx.compute_txid().to_string(), transaction_id);
    assert_eq!(refund_tx.lock_time, LockTime::from_height(850_000).unwrap());

    let refunds = h.store.lock().unwrap().get_unconfirmed_refunds().unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].swap_id, "r2");
    assert_eq!(refunds[0].vin, Some(0));

    // Once the refund confirms, the hold invoice is cancelled.
    h.nursery
        .reverse_sender()
        .send(ReverseSwapEvent::RefundConfirmed {
            id: "r2".to_string(),
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.ln.cancelled_hashes().contains(&preimage_hash) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("hold invoice was not cancelled");

    assert!(h.store.lock().unwrap().get_unconfirmed_refunds().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_conf_rejection_recovers_on_confirmation() {
    let mut h = harness(None);

    let preimage = [44u8; 32];
    let preimage_hash = sha256_preimage(&preimage);
    let claim_keys = h.btc_wallet.get_keys(0);
    let script = swap_script(preimage_hash, &claim_keys);

    let mut swap = submarine_template("s4", preimage_hash, &script);
    swap.invoice = Some("invoice-s4".to_string());
    h.store.lock().unwrap().insert_swap(&swap).unwrap();
    h.ln.expect_payment("invoice-s4", preimage);

    h.btc_watcher.watch_user_lockup(
        "s4",
        swap_nursery::SwapKind::Submarine,
        script.script_pubkey(),
        100_000,
        800_000,
    );

    // Pays 2.5x the expected amount; the overpayment protector refuses it
    // for zero-conf.
    let lockup_tx = lockup_transaction(&script.script_pubkey(), 250_000, 4);
    h.btc_chain.insert_transaction(&lockup_tx);
    h.btc_chain.push_event(ChainSourceEvent::Transaction {
        tx: lockup_tx.clone(),
        confirmed: false,
    });

    wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::ZeroConfRejected { id, .. } if id == "s4")
    })
    .await;
    let stored = h.store.lock().unwrap().get_swap("s4").unwrap().unwrap();
    assert_eq!(stored.status, SwapUpdateEvent::TransactionZeroConfRejected);

    // The confirmation re-enters the normal flow.
    h.btc_chain.push_event(ChainSourceEvent::Transaction {
        tx: lockup_tx.clone(),
        confirmed: true,
    });

    wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::Claim { id, .. } if id == "s4")
    })
    .await;
    let stored = h.store.lock().unwrap().get_swap("s4").unwrap().unwrap();
    assert_eq!(stored.status, SwapUpdateEvent::TransactionClaimed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cyclic_self_payment_cancels_instead_of_settling() {
    let mut h = harness(None);

    let preimage = [55u8; 32];
    let preimage_hash = sha256_preimage(&preimage);
    let keys = h.btc_wallet.get_keys(0);
    let script = swap_script(preimage_hash, &keys);

    // A submarine swap paying the exact invoice of the reverse swap.
    let mut submarine = submarine_template("s5", preimage_hash, &script);
    submarine.invoice = Some("invoice-r5".to_string());
    h.store.lock().unwrap().insert_swap(&submarine).unwrap();

    let mut reverse = reverse_template("r5", preimage_hash, &script, 850_000);
    reverse.invoice = "invoice-r5".to_string();
    h.store.lock().unwrap().insert_reverse_swap(&reverse).unwrap();

    h.ln.set_invoice_state(preimage_hash, InvoiceState::Accepted);

    h.nursery
        .settle_reverse_invoice(&reverse, preimage)
        .await
        .unwrap();

    wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::InvoiceSettled { id } if id == "r5")
    })
    .await;

    // Cancelled, not settled: settling would deadlock the route.
    assert_eq!(h.ln.settled_count(), 0);
    assert!(h.ln.cancelled_hashes().contains(&preimage_hash));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_chain_lockups_send_exactly_one_server_lockup() {
    let mut h = harness(None);

    let preimage = [66u8; 32];
    let preimage_hash = sha256_preimage(&preimage);
    let receiving_keys = h.btc_wallet.get_keys(1);
    let receiving_script = swap_script(preimage_hash, &receiving_keys);

    let user_lockup = lockup_transaction(&receiving_script.script_pubkey(), 75_000, 6);
    h.btc_chain.insert_transaction(&user_lockup);

    let swap = ChainSwap {
        id: "c1".to_string(),
        version: SwapVersion::Legacy,
        preimage_hash: hex::encode(preimage_hash),
        preimage: None,
        sending: ChainSwapLeg {
            symbol: "LTC".to_string(),
            lockup_address: hex::encode(
                ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array([0x77; 20]))
                    .as_bytes(),
            ),
            claim_address: None,
            expected_amount: 70_000,
            timeout_block_height: 820_000,
            transaction_id: None,
            transaction_vout: None,
            amount: None,
            key_index: 2,
            redeem_script: None,
            their_public_key: None,
        },
        receiving: ChainSwapLeg {
            symbol: "BTC".to_string(),
            lockup_address: hex::encode(receiving_script.script_pubkey().as_bytes()),
            claim_address: None,
            expected_amount: 75_000,
            timeout_block_height: 900_000,
            transaction_id: None,
            transaction_vout: None,
            amount: None,
            key_index: 1,
            redeem_script: Some(hex::encode(receiving_script.witness_script().as_bytes())),
            their_public_key: None,
        },
        status: SwapUpdateEvent::SwapCreated,
        claim_miner_fee: None,
    };
    h.store.lock().unwrap().insert_chain_swap(&swap).unwrap();

    let observed = ObservedLockup {
        transaction_id: user_lockup.compute_txid().to_string(),
        vout: 0,
        value: 75_000,
    };

    // Two racing lockup events for the same chain swap.
    for _ in 0..2 {
        h.nursery
            .chain_sender()
            .send(ChainSwapEvent::UserLockup {
                id: "c1".to_string(),
                lockup: observed.clone(),
                confirmed: true,
            })
            .await
            .unwrap();
    }

    wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::CoinsSent { id, .. } if id == "c1")
    })
    .await;

    // Give the second handler time to run, then check it was refused.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.ltc_wallet.sent_count(), 1);

    let stored = h.store.lock().unwrap().get_chain_swap("c1").unwrap().unwrap();
    assert_eq!(stored.status, SwapUpdateEvent::TransactionServerMempool);
    let server_lockup_txid = stored.sending.transaction_id.clone().unwrap();

    // The user claims the server lockup on LTC, revealing the preimage; the
    // nursery claims the user lockup on BTC.
    h.ltc_chain.push_event(ChainSourceEvent::Transaction {
        tx: claim_spend(server_lockup_txid.parse().unwrap(), preimage),
        confirmed: true,
    });

    wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::Claim { id, .. } if id == "c1")
    })
    .await;

    let stored = h.store.lock().unwrap().get_chain_swap("c1").unwrap().unwrap();
    assert_eq!(stored.status, SwapUpdateEvent::TransactionClaimed);
    assert!(stored.claim_miner_fee.is_some());
    assert_eq!(stored.preimage.as_deref(), Some(hex::encode(preimage).as_str()));

    let claim_tx = h.btc_chain.last_broadcast().expect("claim broadcast");
    assert_eq!(
        claim_tx.input[0].previous_output.txid,
        user_lockup.compute_txid()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deferred_claims_emit_claim_pending() {
    let claimer = RecordingClaimer::new(true);
    let mut h = harness(Some(claimer.clone()));

    let preimage = [77u8; 32];
    let preimage_hash = sha256_preimage(&preimage);
    let claim_keys = h.btc_wallet.get_keys(0);
    let script = swap_script(preimage_hash, &claim_keys);

    let mut swap = submarine_template("s7", preimage_hash, &script);
    swap.invoice = Some("invoice-s7".to_string());
    h.store.lock().unwrap().insert_swap(&swap).unwrap();
    h.ln.expect_payment("invoice-s7", preimage);

    h.btc_watcher.watch_user_lockup(
        "s7",
        swap_nursery::SwapKind::Submarine,
        script.script_pubkey(),
        100_000,
        800_000,
    );

    let lockup_tx = lockup_transaction(&script.script_pubkey(), 100_000, 7);
    h.btc_chain.insert_transaction(&lockup_tx);
    h.btc_chain.push_event(ChainSourceEvent::Transaction {
        tx: lockup_tx,
        confirmed: true,
    });

    wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::ClaimPending { id, .. } if id == "s7")
    })
    .await;

    assert_eq!(claimer.offered_count(), 1);
    // No claim was broadcast; the deferred claimer owns it now.
    assert_eq!(h.btc_chain.broadcast_count(), 0);
    let stored = h.store.lock().unwrap().get_swap("s7").unwrap().unwrap();
    assert_eq!(stored.status, SwapUpdateEvent::TransactionClaimPending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expiry_without_lockup_marks_swap_expired() {
    let mut h = harness(None);

    let preimage = [88u8; 32];
    let preimage_hash = sha256_preimage(&preimage);
    let keys = h.btc_wallet.get_keys(0);
    let script = swap_script(preimage_hash, &keys);

    let swap = reverse_template("r8", preimage_hash, &script, 810_000);
    h.store.lock().unwrap().insert_reverse_swap(&swap).unwrap();

    h.nursery
        .reverse_sender()
        .send(ReverseSwapEvent::Expired {
            id: "r8".to_string(),
        })
        .await
        .unwrap();

    wait_for(&mut h.events, |e| {
        matches!(e, NurseryEvent::Expiration { id, .. } if id == "r8")
    })
    .await;

    let stored = h
        .store
        .lock()
        .unwrap()
        .get_reverse_swap("r8")
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SwapUpdateEvent::SwapExpired);
    // No lockup was ever broadcast, so nothing was refunded.
    assert!(h.store.lock().unwrap().get_unconfirmed_refunds().unwrap().is_empty());

    // Re-delivery of the terminal event is a no-op.
    h.nursery
        .reverse_sender()
        .send(ReverseSwapEvent::Expired {
            id: "r8".to_string(),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = h
        .store
        .lock()
        .unwrap()
        .get_reverse_swap("r8")
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SwapUpdateEvent::SwapExpired);
}
