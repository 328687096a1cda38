#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use tokio::sync::mpsc;

use swap_nursery::chain::{ChainClient, ChainSourceEvent, Wallet, WalletTransaction};
use swap_nursery::currency::CurrencyType;
use swap_nursery::ethereum::{
    ContractEvent, ContractHandler, Erc20SwapValues, EtherSwapValues, EvmTransaction,
};
use swap_nursery::lightning::{
    HoldInvoice, HoldInvoiceUpdate, InvoiceState, LightningClient, LightningError,
    LightningResult, PayOptions,
};
use swap_nursery::nursery::claim::DeferredClaimer;
use swap_nursery::swap::SwapKind;

// --- chain client ---

pub struct MockChainClient {
    symbol: String,
    chain_type: CurrencyType,
    pub fee_per_vbyte: f64,
    transactions: Mutex<HashMap<String, String>>,
    pub broadcasts: Mutex<Vec<String>>,
    confirmations: Mutex<HashMap<String, u32>>,
    input_filters: Mutex<Vec<Txid>>,
    output_filters: Mutex<Vec<ScriptBuf>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChainSourceEvent>>>,
}

impl MockChainClient {
    pub fn new(symbol: &str) -> Arc<Self> {
        Arc::new(Self {
            symbol: symbol.to_string(),
            chain_type: CurrencyType::BitcoinLike,
            fee_per_vbyte: 2.0,
            transactions: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            confirmations: Mutex::new(HashMap::new()),
            input_filters: Mutex::new(Vec::new()),
            output_filters: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Makes a transaction fetchable through `get_raw_transaction`.
    pub fn insert_transaction(&self, tx: &Transaction) {
        let txid = tx.compute_txid().to_string();
        let hex = bitcoin::consensus::encode::serialize_hex(tx);
        self.transactions.lock().unwrap().insert(txid, hex);
    }

    pub fn set_confirmations(&self, txid: &str, confirmations: u32) {
        self.confirmations
            .lock()
            .unwrap()
            .insert(txid.to_string(), confirmations);
    }

    pub fn push_event(&self, event: ChainSourceEvent) {
        for subscriber in self.subscribers.lock().unwrap().iter() {
            let _ = subscriber.send(event.clone());
        }
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }

    pub fn last_broadcast(&self) -> Option<Transaction> {
        let broadcasts = self.broadcasts.lock().unwrap();
        let txid = broadcasts.last()?;
        let transactions = self.transactions.lock().unwrap();
        let hex = transactions.get(txid)?;
        bitcoin::consensus::encode::deserialize_hex(hex).ok()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn chain_type(&self) -> CurrencyType {
        self.chain_type
    }

    async fn estimate_fee(&self, _target_blocks: Option<u32>) -> Result<f64> {
        Ok(self.fee_per_vbyte)
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<String> {
        self.transactions
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .with_context(|| format!("unknown transaction: {txid}"))
    }

    async fn send_raw_transaction(&self, tx_hex: &str, _relaxed_fee_policy: bool) -> Result<String> {
        let tx: Transaction =
            bitcoin::consensus::encode::deserialize_hex(tx_hex).context("decode broadcast")?;
        let txid = tx.compute_txid().to_string();
        self.transactions
            .lock()
            .unwrap()
            .insert(txid.clone(), tx_hex.to_string());
        self.broadcasts.lock().unwrap().push(txid.clone());
        Ok(txid)
    }

    async fn transaction_confirmations(&self, txid: &str) -> Result<Option<u32>> {
        Ok(self.confirmations.lock().unwrap().get(txid).copied())
    }

    fn add_input_filter(&self, outpoint_txid: Txid) {
        self.input_filters.lock().unwrap().push(outpoint_txid);
    }

    fn add_output_filter(&self, script: ScriptBuf) {
        self.output_filters.lock().unwrap().push(script);
    }

    fn remove_input_filter(&self, outpoint_txid: &Txid) {
        self.input_filters
            .lock()
            .unwrap()
            .retain(|t| t != outpoint_txid);
    }

    fn remove_output_filter(&self, script: &ScriptBuf) {
        self.output_filters.lock().unwrap().retain(|s| s != script);
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChainSourceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

// --- wallet ---

pub struct MockWallet {
    symbol: String,
    chain: Arc<MockChainClient>,
    counter: AtomicU64,
    pub sent: Mutex<Vec<(String, u64)>>,
}

impl MockWallet {
    pub fn new(symbol: &str, chain: Arc<MockChainClient>) -> Arc<Self> {
        Arc::new(Self {
            symbol: symbol.to_string(),
            chain,
            counter: AtomicU64::new(1),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn get_keys(&self, index: u32) -> bitcoin::secp256k1::Keypair {
        Wallet::get_keys_by_index(self, index).expect("mock keys")
    }

    pub fn receive_script() -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array([0xab; 20]))
    }
}

#[async_trait]
impl Wallet for MockWallet {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn send_to_address(
        &self,
        address: &str,
        amount_sat: u64,
        fee_per_vbyte: f64,
        _label: &str,
    ) -> Result<WalletTransaction> {
        let script = self.decode_address(address)?;
        let nonce = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut funding_txid = [0u8; 32];
        funding_txid[..8].copy_from_slice(&nonce.to_le_bytes());

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array(funding_txid),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(amount_sat),
                script_pubkey: script,
            }],
        };
        self.chain.insert_transaction(&tx);

        let transaction_id = tx.compute_txid().to_string();
        self.sent
            .lock()
            .unwrap()
            .push((transaction_id.clone(), amount_sat));

        Ok(WalletTransaction {
            transaction_hex: bitcoin::consensus::encode::serialize_hex(&tx),
            transaction_id,
            vout: 0,
            fee: (fee_per_vbyte * 153.0).ceil() as u64,
        })
    }

    async fn get_address(&self, _label: &str) -> Result<String> {
        Ok(hex::encode(Self::receive_script().as_bytes()))
    }

    fn get_keys_by_index(&self, index: u32) -> Result<bitcoin::secp256k1::Keypair> {
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let mut bytes = [7u8; 32];
        bytes[0] = (index + 1) as u8;
        let sk = bitcoin::secp256k1::SecretKey::from_slice(&bytes).context("mock key")?;
        Ok(bitcoin::secp256k1::Keypair::from_secret_key(&secp, &sk))
    }

    fn decode_address(&self, address: &str) -> Result<ScriptBuf> {
        // Mock addresses are hex-encoded scriptPubKeys.
        Ok(ScriptBuf::from(
            hex::decode(address).context("decode mock address")?,
        ))
    }
}

// --- lightning ---

pub struct MockLightningClient {
    id: String,
    symbol: String,
    preimages: Mutex<HashMap<String, [u8; 32]>>,
    pub paid: Mutex<Vec<String>>,
    pub settled: Mutex<Vec<[u8; 32]>>,
    pub cancelled: Mutex<Vec<[u8; 32]>>,
    invoices: Mutex<HashMap<[u8; 32], HoldInvoice>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<HoldInvoiceUpdate>>>,
}

impl MockLightningClient {
    pub fn new(id: &str, symbol: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            symbol: symbol.to_string(),
            preimages: Mutex::new(HashMap::new()),
            paid: Mutex::new(Vec::new()),
            settled: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            invoices: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Registers the preimage `pay` hands back for an invoice.
    pub fn expect_payment(&self, invoice: &str, preimage: [u8; 32]) {
        self.preimages
            .lock()
            .unwrap()
            .insert(invoice.to_string(), preimage);
    }

    pub fn set_invoice_state(&self, preimage_hash: [u8; 32], state: InvoiceState) {
        self.invoices.lock().unwrap().insert(
            preimage_hash,
            HoldInvoice {
                state,
                htlcs: Vec::new(),
            },
        );
    }

    pub fn push_update(&self, update: HoldInvoiceUpdate) {
        for subscriber in self.subscribers.lock().unwrap().iter() {
            let _ = subscriber.send(update.clone());
        }
    }

    pub fn settled_count(&self) -> usize {
        self.settled.lock().unwrap().len()
    }

    pub fn cancelled_hashes(&self) -> Vec<[u8; 32]> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl LightningClient for MockLightningClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn pay(&self, invoice: &str, _options: PayOptions) -> LightningResult<[u8; 32]> {
        let preimage = self
            .preimages
            .lock()
            .unwrap()
            .get(invoice)
            .copied()
            .ok_or_else(|| LightningError::PaymentPermanent("no route".to_string()))?;
        self.paid.lock().unwrap().push(invoice.to_string());
        Ok(preimage)
    }

    async fn add_hold_invoice(
        &self,
        _amount_msat: u64,
        preimage_hash: &[u8; 32],
        _expiry_secs: u32,
        _memo: &str,
    ) -> LightningResult<String> {
        self.set_invoice_state(*preimage_hash, InvoiceState::Open);
        Ok(format!("lnmock{}", hex::encode(preimage_hash)))
    }

    async fn settle_hold_invoice(&self, preimage: &[u8; 32]) -> LightningResult<()> {
        self.settled.lock().unwrap().push(*preimage);
        Ok(())
    }

    async fn cancel_hold_invoice(&self, preimage_hash: &[u8; 32]) -> LightningResult<()> {
        let mut invoices = self.invoices.lock().unwrap();
        if invoices.remove(preimage_hash).is_none() {
            return Err(LightningError::NotFound);
        }
        drop(invoices);
        self.cancelled.lock().unwrap().push(*preimage_hash);
        Ok(())
    }

    async fn lookup_hold_invoice(&self, preimage_hash: &[u8; 32]) -> LightningResult<HoldInvoice> {
        self.invoices
            .lock()
            .unwrap()
            .get(preimage_hash)
            .cloned()
            .ok_or(LightningError::NotFound)
    }

    fn subscribe_hold_invoices(&self) -> mpsc::UnboundedReceiver<HoldInvoiceUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

// --- contracts ---

pub struct MockContractHandler {
    pub lockups: Mutex<Vec<String>>,
    pub claims: Mutex<Vec<[u8; 32]>>,
    pub refunds: Mutex<Vec<[u8; 32]>>,
    ether_values: Mutex<HashMap<String, EtherSwapValues>>,
    counter: AtomicU64,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ContractEvent>>>,
}

impl MockContractHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lockups: Mutex::new(Vec::new()),
            claims: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
            ether_values: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn set_ether_values(&self, lockup_hash: &str, values: EtherSwapValues) {
        self.ether_values
            .lock()
            .unwrap()
            .insert(lockup_hash.to_string(), values);
    }

    pub fn push_event(&self, event: ContractEvent) {
        for subscriber in self.subscribers.lock().unwrap().iter() {
            let _ = subscriber.send(event.clone());
        }
    }

    fn next_tx(&self) -> EvmTransaction {
        let nonce = self.counter.fetch_add(1, Ordering::SeqCst);
        EvmTransaction {
            hash: format!("0x{nonce:064x}"),
            gas_used: 21_000,
            effective_gas_price: 2,
        }
    }
}

#[async_trait]
impl ContractHandler for MockContractHandler {
    async fn lockup_ether(
        &self,
        preimage_hash: &[u8; 32],
        _amount_wei: u128,
        _claim_address: &str,
        _timelock: u64,
    ) -> Result<EvmTransaction> {
        self.lockups.lock().unwrap().push(hex::encode(preimage_hash));
        Ok(self.next_tx())
    }

    async fn lockup_ether_prepay_minerfee(
        &self,
        preimage_hash: &[u8; 32],
        _amount_wei: u128,
        _prepay_wei: u128,
        _claim_address: &str,
        _timelock: u64,
    ) -> Result<EvmTransaction> {
        self.lockups.lock().unwrap().push(hex::encode(preimage_hash));
        Ok(self.next_tx())
    }

    async fn lockup_token(
        &self,
        preimage_hash: &[u8; 32],
        _amount: u128,
        _claim_address: &str,
        _timelock: u64,
    ) -> Result<EvmTransaction> {
        self.lockups.lock().unwrap().push(hex::encode(preimage_hash));
        Ok(self.next_tx())
    }

    async fn lockup_token_prepay_minerfee(
        &self,
        preimage_hash: &[u8; 32],
        _amount: u128,
        _prepay_wei: u128,
        _claim_address: &str,
        _timelock: u64,
    ) -> Result<EvmTransaction> {
        self.lockups.lock().unwrap().push(hex::encode(preimage_hash));
        Ok(self.next_tx())
    }

    async fn claim_ether(
        &self,
        preimage: &[u8; 32],
        _values: &EtherSwapValues,
    ) -> Result<EvmTransaction> {
        self.claims.lock().unwrap().push(*preimage);
        Ok(self.next_tx())
    }

    async fn claim_token(
        &self,
        preimage: &[u8; 32],
        _values: &Erc20SwapValues,
    ) -> Result<EvmTransaction> {
        self.claims.lock().unwrap().push(*preimage);
        Ok(self.next_tx())
    }

    async fn refund_ether(
        &self,
        preimage_hash: &[u8; 32],
        _values: &EtherSwapValues,
    ) -> Result<EvmTransaction> {
        self.refunds.lock().unwrap().push(*preimage_hash);
        Ok(self.next_tx())
    }

    async fn refund_token(
        &self,
        preimage_hash: &[u8; 32],
        _values: &Erc20SwapValues,
    ) -> Result<EvmTransaction> {
        self.refunds.lock().unwrap().push(*preimage_hash);
        Ok(self.next_tx())
    }

    async fn ether_swap_values(&self, lockup_transaction_hash: &str) -> Result<EtherSwapValues> {
        self.ether_values
            .lock()
            .unwrap()
            .get(lockup_transaction_hash)
            .cloned()
            .with_context(|| format!("no lockup values for {lockup_transaction_hash}"))
    }

    async fn erc20_swap_values(&self, lockup_transaction_hash: &str) -> Result<Erc20SwapValues> {
        anyhow::bail!("no erc20 lockup for {lockup_transaction_hash}")
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ContractEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

// --- deferred claimer ---

pub struct RecordingClaimer {
    accept: bool,
    pub offered: AtomicUsize,
}

impl RecordingClaimer {
    pub fn new(accept: bool) -> Arc<Self> {
        Arc::new(Self {
            accept,
            offered: AtomicUsize::new(0),
        })
    }

    pub fn offered_count(&self) -> usize {
        self.offered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeferredClaimer for RecordingClaimer {
    async fn defer(&self, _kind: SwapKind, _swap_id: &str, _preimage: [u8; 32]) -> bool {
        self.offered.fetch_add(1, Ordering::SeqCst);
        self.accept
    }
}
