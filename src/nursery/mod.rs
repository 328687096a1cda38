pub mod claim;
pub mod events;
pub mod payment;
pub mod refund;

use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::Txid;
use tokio::sync::{broadcast, mpsc};

use crate::chain::watcher::UtxoChainWatcher;
use crate::config::NurseryConfig;
use crate::currency::{Currency, CurrencyMap, CurrencyType};
use crate::ethereum::watcher::{EthereumWatcher, EvmLockupRole};
use crate::ethereum::{EvmTransaction, amount_to_wei};
use crate::lightning::invoice::amount_msat_from_bolt11;
use crate::lightning::watcher::cancel_reverse_invoices;
use crate::lightning::{InvoiceState, LightningClient, LightningError, race_call};
use crate::swap::store::{SqliteStore, lockup_label};
use crate::swap::{
    ChainSwap, OrderSide, ReverseSwap, Submarine, SwapKind, SwapUpdateEvent, chain_currency,
    lightning_currency, prepay_fee_per_vbyte, split_pair,
};
use crate::utxo::sha256_preimage;
use claim::{DeferredClaimer, UtxoSpend, claim_utxo};
use events::{
    ChainSwapEvent, NurseryEvent, ObservedLockup, ReverseSwapEvent, SubmarineEvent,
};
use payment::{ChannelNursery, NodeSwitch, PaymentHandler};
use refund::{refund_evm, refund_utxo};

/// Freezes the price of a set-invoice-after-lockup submarine swap at the
/// moment the lockup is observed. Quoting itself lives outside the nursery.
pub trait RateProvider: Send + Sync {
    fn current_rate(&self, pair: &str, side: OrderSide) -> Result<f64>;
}

type Receivers = (
    mpsc::Receiver<SubmarineEvent>,
    mpsc::Receiver<ReverseSwapEvent>,
    mpsc::Receiver<ChainSwapEvent>,
);

/// The orchestrator. Three serial tasks, one per swap kind, consume bounded
/// FIFO queues; watchers block on a full queue instead of dropping events.
/// Handlers for one kind never interleave.
///
/// Shutdown: stop the watchers, then drop this handle (and any cloned
/// senders). The queue tasks drain what is already enqueued and exit.
pub struct SwapNursery {
    inner: Arc<Nursery>,
    submarine_tx: mpsc::Sender<SubmarineEvent>,
    reverse_tx: mpsc::Sender<ReverseSwapEvent>,
    chain_tx: mpsc::Sender<ChainSwapEvent>,
    receivers: Mutex<Option<Receivers>>,
}

impl SwapNursery {
    pub fn new(
        config: NurseryConfig,
        currencies: CurrencyMap,
        store: Arc<Mutex<SqliteStore>>,
        node_switch: NodeSwitch,
        channel_nursery: Option<Arc<dyn ChannelNursery>>,
        claimer: Option<Arc<dyn DeferredClaimer>>,
        rates: Option<Arc<dyn RateProvider>>,
    ) -> Self {
        let (submarine_tx, submarine_rx) = mpsc::channel(config.event_queue_depth);
        let (reverse_tx, reverse_rx) = mpsc::channel(config.event_queue_depth);
        let (chain_tx, chain_rx) = mpsc::channel(config.event_queue_depth);
        let (events_tx, _) = broadcast::channel(1024);

        let payment = PaymentHandler::new(store.clone(), node_switch, channel_nursery, &config);
        let lightning_timeout = Duration::from_millis(config.lightning_client_call_timeout_ms);

        let inner = Arc::new(Nursery {
            config,
            currencies,
            store,
            payment,
            claimer,
            rates,
            watchers: RwLock::new(HashMap::new()),
            evm_watchers: RwLock::new(HashMap::new()),
            events_tx,
            retry_guard: tokio::sync::Mutex::new(()),
            lightning_timeout,
        });

        Self {
            inner,
            submarine_tx,
            reverse_tx,
            chain_tx,
            receivers: Mutex::new(Some((submarine_rx, reverse_rx, chain_rx))),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NurseryEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn submarine_sender(&self) -> mpsc::Sender<SubmarineEvent> {
        self.submarine_tx.clone()
    }

    pub fn reverse_sender(&self) -> mpsc::Sender<ReverseSwapEvent> {
        self.reverse_tx.clone()
    }

    pub fn chain_sender(&self) -> mpsc::Sender<ChainSwapEvent> {
        self.chain_tx.clone()
    }

    /// Makes a UTXO watcher reachable for post-lockup filter installation.
    pub fn register_chain_watcher(&self, watcher: Arc<UtxoChainWatcher>) {
        self.inner
            .watchers
            .write()
            .expect("watcher registry poisoned")
            .insert(watcher.symbol().to_string(), watcher);
    }

    pub fn register_ethereum_watcher(&self, watcher: Arc<EthereumWatcher>) {
        self.inner
            .evm_watchers
            .write()
            .expect("watcher registry poisoned")
            .insert(watcher.symbol().to_string(), watcher);
    }

    /// Spawns the three category loops and the settlement retry timer.
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let (mut submarine_rx, mut reverse_rx, mut chain_rx) = self
            .receivers
            .lock()
            .expect("receiver mutex poisoned")
            .take()
            .expect("nursery already started");

        let mut handles = Vec::new();

        let inner = self.inner.clone();
        handles.push(tokio::spawn(async move {
            while let Some(event) = submarine_rx.recv().await {
                inner.handle_submarine(event).await;
            }
        }));

        let inner = self.inner.clone();
        handles.push(tokio::spawn(async move {
            while let Some(event) = reverse_rx.recv().await {
                inner.handle_reverse(event).await;
            }
        }));

        let inner = self.inner.clone();
        handles.push(tokio::spawn(async move {
            while let Some(event) = chain_rx.recv().await {
                inner.handle_chain(event).await;
            }
        }));

        if self.inner.config.retry_interval_secs > 0 {
            let inner = self.inner.clone();
            let submarine_tx = self.submarine_tx.clone();
            handles.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(Duration::from_secs(
                    inner.config.retry_interval_secs,
                ));
                loop {
                    timer.tick().await;
                    inner.retry_pending_settlements(&submarine_tx).await;
                }
            }));
        }

        handles
    }

    /// Pays the invoice of a submarine swap and claims its lockup; `Ok` with
    /// the payment still in flight leaves the swap for the retry timer.
    pub async fn attempt_settle_submarine(
        &self,
        swap: &Submarine,
        outgoing_channel_id: Option<String>,
    ) -> Result<()> {
        self.inner
            .attempt_settle_submarine(swap, outgoing_channel_id)
            .await
    }

    /// Claims the user lockup of a chain swap with a preimage revealed on
    /// the sending chain.
    pub async fn attempt_settle_chain(&self, swap: &ChainSwap, preimage: [u8; 32]) -> Result<()> {
        self.inner.attempt_settle_chain(swap, preimage).await
    }

    /// Settles (or, for cyclic self-payments, cancels) the hold invoice of a
    /// reverse swap.
    pub async fn settle_reverse_invoice(
        &self,
        swap: &ReverseSwap,
        preimage: [u8; 32],
    ) -> Result<()> {
        self.inner.settle_reverse_invoice(swap, preimage).await
    }
}

struct Nursery {
    config: NurseryConfig,
    currencies: CurrencyMap,
    store: Arc<Mutex<SqliteStore>>,
    payment: PaymentHandler,
    claimer: Option<Arc<dyn DeferredClaimer>>,
    rates: Option<Arc<dyn RateProvider>>,
    watchers: RwLock<HashMap<String, Arc<UtxoChainWatcher>>>,
    evm_watchers: RwLock<HashMap<String, Arc<EthereumWatcher>>>,
    events_tx: broadcast::Sender<NurseryEvent>,
    retry_guard: tokio::sync::Mutex<()>,
    lightning_timeout: Duration,
}

impl Nursery {
    fn emit(&self, event: NurseryEvent) {
        let _ = self.events_tx.send(event);
    }

    fn alert(&self, id: Option<&str>, message: String) {
        tracing::error!(swap_id = id.unwrap_or("-"), %message, "operator attention required");
        self.emit(NurseryEvent::Alert {
            id: id.map(str::to_string),
            message,
        });
    }

    fn currency(&self, symbol: &str) -> Result<Currency> {
        self.currencies
            .get(symbol)
            .cloned()
            .with_context(|| format!("unknown currency: {symbol}"))
    }

    fn prune_watchers(&self, swap_id: &str) {
        for watcher in self
            .watchers
            .read()
            .expect("watcher registry poisoned")
            .values()
        {
            watcher.remove_swap(swap_id);
        }
        for watcher in self
            .evm_watchers
            .read()
            .expect("watcher registry poisoned")
            .values()
        {
            watcher.remove_swap(swap_id);
        }
    }

    // --- status helpers ---

    fn advance_submarine(&self, id: &str, next: SwapUpdateEvent) -> Result<bool> {
        let mut store = self.store.lock().expect("store mutex poisoned");
        let swap = store
            .get_swap(id)?
            .with_context(|| format!("swap not found: {id}"))?;
        if !swap.status.may_advance_to(next, SwapKind::Submarine) {
            tracing::debug!(
                swap_id = %id,
                from = swap.status.as_str(),
                to = next.as_str(),
                "refusing status transition"
            );
            return Ok(false);
        }
        store.set_swap_status(id, next)?;
        Ok(true)
    }

    fn advance_reverse(&self, id: &str, next: SwapUpdateEvent) -> Result<bool> {
        let mut store = self.store.lock().expect("store mutex poisoned");
        let swap = store
            .get_reverse_swap(id)?
            .with_context(|| format!("reverse swap not found: {id}"))?;
        if !swap.status.may_advance_to(next, SwapKind::ReverseSubmarine) {
            tracing::debug!(
                swap_id = %id,
                from = swap.status.as_str(),
                to = next.as_str(),
                "refusing status transition"
            );
            return Ok(false);
        }
        store.set_reverse_swap_status(id, next)?;
        Ok(true)
    }

    fn advance_chain(&self, id: &str, next: SwapUpdateEvent) -> Result<bool> {
        let mut store = self.store.lock().expect("store mutex poisoned");
        let swap = store
            .get_chain_swap(id)?
            .with_context(|| format!("chain swap not found: {id}"))?;
        if !swap.status.may_advance_to(next, SwapKind::Chain) {
            tracing::debug!(
                swap_id = %id,
                from = swap.status.as_str(),
                to = next.as_str(),
                "refusing status transition"
            );
            return Ok(false);
        }
        store.set_chain_swap_status(id, next)?;
        Ok(true)
    }

    fn get_submarine(&self, id: &str) -> Result<Submarine> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .get_swap(id)?
            .with_context(|| format!("swap not found: {id}"))
    }

    fn get_reverse(&self, id: &str) -> Result<ReverseSwap> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .get_reverse_swap(id)?
            .with_context(|| format!("reverse swap not found: {id}"))
    }

    fn get_chain(&self, id: &str) -> Result<ChainSwap> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .get_chain_swap(id)?
            .with_context(|| format!("chain swap not found: {id}"))
    }

    // --- submarine queue ---

    async fn handle_submarine(&self, event: SubmarineEvent) {
        let id = match &event {
            SubmarineEvent::Lockup { id, .. }
            | SubmarineEvent::LockupFailed { id, .. }
            | SubmarineEvent::ZeroConfRejected { id, .. }
            | SubmarineEvent::Expired { id }
            | SubmarineEvent::RetrySettle { id } => id.clone(),
        };

        let result = match event {
            SubmarineEvent::Lockup {
                id,
                lockup,
                confirmed,
            } => self.submarine_lockup(&id, lockup, confirmed).await,
            SubmarineEvent::LockupFailed { id, reason } => {
                self.submarine_lockup_failed(&id, reason).await
            }
            SubmarineEvent::ZeroConfRejected { id, reason } => {
                self.submarine_zero_conf_rejected(&id, reason).await
            }
            SubmarineEvent::Expired { id } => self.submarine_expired(&id).await,
            SubmarineEvent::RetrySettle { id } => self.submarine_retry_settle(&id).await,
        };

        if let Err(err) = result {
            tracing::error!(swap_id = %id, error = %format!("{err:#}"), "submarine handler failed");
            self.emit(NurseryEvent::Alert {
                id: Some(id),
                message: format!("{err:#}"),
            });
        }
    }

    async fn submarine_lockup(
        &self,
        id: &str,
        lockup: ObservedLockup,
        confirmed: bool,
    ) -> Result<()> {
        let swap = self.get_submarine(id)?;
        if swap.status.is_final(SwapKind::Submarine) {
            return Ok(());
        }

        if swap.lockup_transaction_id.is_none() {
            self.store
                .lock()
                .expect("store mutex poisoned")
                .set_swap_lockup_transaction(id, &lockup.transaction_id, lockup.vout, lockup.value)?;
        }

        let next = if confirmed {
            SwapUpdateEvent::TransactionConfirmed
        } else {
            SwapUpdateEvent::TransactionMempool
        };
        if self.advance_submarine(id, next)? {
            self.emit(NurseryEvent::Transaction {
                kind: SwapKind::Submarine,
                id: id.to_string(),
                transaction_id: lockup.transaction_id.clone(),
                confirmed,
            });
        }

        let swap = self.get_submarine(id)?;
        if swap.invoice.is_some() {
            self.attempt_settle_submarine(&swap, None).await
        } else {
            // Set-invoice-after-lockup: freeze the price now, settle once
            // the invoice arrives.
            if swap.rate.is_none()
                && let Some(rates) = &self.rates
            {
                let rate = rates.current_rate(&swap.pair, swap.order_side)?;
                self.store
                    .lock()
                    .expect("store mutex poisoned")
                    .set_swap_rate(id, rate)?;
                tracing::info!(swap_id = %id, rate, "froze rate for invoice-less lockup");
            }
            Ok(())
        }
    }

    async fn submarine_lockup_failed(&self, id: &str, reason: String) -> Result<()> {
        if self.advance_submarine(id, SwapUpdateEvent::TransactionLockupFailed)? {
            self.emit(NurseryEvent::LockupFailed {
                kind: SwapKind::Submarine,
                id: id.to_string(),
                reason,
            });
        }
        self.prune_watchers(id);
        Ok(())
    }

    async fn submarine_zero_conf_rejected(&self, id: &str, reason: String) -> Result<()> {
        // The swap is not cancelled; the confirmed lockup still goes the
        // normal path.
        if self.advance_submarine(id, SwapUpdateEvent::TransactionZeroConfRejected)? {
            self.emit(NurseryEvent::ZeroConfRejected {
                kind: SwapKind::Submarine,
                id: id.to_string(),
                reason,
            });
        }
        Ok(())
    }

    async fn submarine_expired(&self, id: &str) -> Result<()> {
        let swap = self.get_submarine(id)?;
        if swap.status == SwapUpdateEvent::SwapExpired || swap.status.is_final(SwapKind::Submarine)
        {
            return Ok(());
        }
        if self.advance_submarine(id, SwapUpdateEvent::SwapExpired)? {
            tracing::info!(swap_id = %id, "onchain HTLC timed out");
            self.emit(NurseryEvent::Expiration {
                kind: SwapKind::Submarine,
                id: id.to_string(),
            });
        }
        self.prune_watchers(id);
        Ok(())
    }

    async fn submarine_retry_settle(&self, id: &str) -> Result<()> {
        let swap = self.get_submarine(id)?;
        if !matches!(
            swap.status,
            SwapUpdateEvent::InvoicePending | SwapUpdateEvent::InvoicePaid
        ) {
            return Ok(());
        }
        self.attempt_settle_submarine(&swap, None).await
    }

    async fn attempt_settle_submarine(
        &self,
        swap: &Submarine,
        outgoing_channel_id: Option<String>,
    ) -> Result<()> {
        let (base, quote) = split_pair(&swap.pair)?;
        let lightning_symbol = lightning_currency(base, quote, swap.order_side, false);
        let lightning = self.currency(lightning_symbol)?;

        let Some(preimage) = self
            .payment
            .pay_invoice(&lightning, swap, outgoing_channel_id)
            .await?
        else {
            // Still in flight; the retry timer re-drives this swap.
            return Ok(());
        };

        self.claim_submarine(&swap.id, preimage).await
    }

    async fn claim_submarine(&self, id: &str, preimage: [u8; 32]) -> Result<()> {
        let swap = self.get_submarine(id)?;

        if let Some(claimer) = &self.claimer
            && claimer.defer(SwapKind::Submarine, id, preimage).await
        {
            if self.advance_submarine(id, SwapUpdateEvent::TransactionClaimPending)? {
                self.emit(NurseryEvent::ClaimPending {
                    kind: SwapKind::Submarine,
                    id: id.to_string(),
                });
            }
            return Ok(());
        }

        let (base, quote) = split_pair(&swap.pair)?;
        let chain_symbol = chain_currency(base, quote, swap.order_side, false);
        let currency = self.currency(chain_symbol)?;
        let lockup_transaction_id = swap
            .lockup_transaction_id
            .as_deref()
            .context("no lockup transaction recorded")?;

        let (transaction_id, fee) = if currency.currency_type.is_utxo_based() {
            claim_utxo(
                &currency,
                &self.store,
                UtxoSpend {
                    kind: SwapKind::Submarine,
                    swap_id: id,
                    version: swap.version,
                    lockup_transaction_id,
                    lockup_vout: swap.lockup_transaction_vout.unwrap_or(0),
                    key_index: swap.key_index,
                    redeem_script: swap.redeem_script.as_deref(),
                    their_public_key: swap.their_public_key.as_deref(),
                    timeout_block_height: swap.timeout_block_height,
                },
                preimage,
            )
            .await?
        } else {
            let tx = self
                .claim_evm(&currency, &preimage, lockup_transaction_id)
                .await?;
            (tx.hash.clone(), tx.fee())
        };

        {
            let mut store = self.store.lock().expect("store mutex poisoned");
            store.set_swap_miner_fee(id, fee)?;
        }
        if self.advance_submarine(id, SwapUpdateEvent::TransactionClaimed)? {
            self.emit(NurseryEvent::Claim {
                kind: SwapKind::Submarine,
                id: id.to_string(),
                transaction_id,
            });
        }
        self.prune_watchers(id);
        Ok(())
    }

    async fn claim_evm(
        &self,
        currency: &Currency,
        preimage: &[u8; 32],
        lockup_transaction_hash: &str,
    ) -> Result<EvmTransaction> {
        let manager = currency
            .ethereum
            .as_ref()
            .with_context(|| format!("{} has no ethereum manager", currency.symbol))?;
        match currency.currency_type {
            CurrencyType::Ether => {
                let values = manager
                    .handler
                    .ether_swap_values(lockup_transaction_hash)
                    .await
                    .context("query ether swap values")?;
                manager
                    .handler
                    .claim_ether(preimage, &values)
                    .await
                    .context("claim ether")
            }
            CurrencyType::Erc20 => {
                let values = manager
                    .handler
                    .erc20_swap_values(lockup_transaction_hash)
                    .await
                    .context("query erc20 swap values")?;
                manager
                    .handler
                    .claim_token(preimage, &values)
                    .await
                    .context("claim token")
            }
            other => anyhow::bail!("{other:?} is not an EVM currency"),
        }
    }

    async fn retry_pending_settlements(&self, submarine_tx: &mpsc::Sender<SubmarineEvent>) {
        // Skip the run entirely when the previous one is still going.
        let Ok(_guard) = self.retry_guard.try_lock() else {
            return;
        };

        let pending = match self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_swaps_with_status(&[SwapUpdateEvent::InvoicePending, SwapUpdateEvent::InvoicePaid])
        {
            Ok(pending) => pending,
            Err(err) => {
                tracing::error!(error = %err, "retry timer could not list pending swaps");
                return;
            }
        };

        for swap in pending {
            let _ = submarine_tx
                .send(SubmarineEvent::RetrySettle { id: swap.id })
                .await;
        }
    }

    // --- reverse queue ---

    async fn handle_reverse(&self, event: ReverseSwapEvent) {
        let id = match &event {
            ReverseSwapEvent::InvoicePaid { id }
            | ReverseSwapEvent::MinerFeeInvoicePaid { id }
            | ReverseSwapEvent::InvoiceExpired { id }
            | ReverseSwapEvent::ServerLockupConfirmed { id }
            | ReverseSwapEvent::Claimed { id, .. }
            | ReverseSwapEvent::Expired { id }
            | ReverseSwapEvent::RefundConfirmed { id }
            | ReverseSwapEvent::LockupFailedToSend { id, .. } => id.clone(),
        };

        let result = match event {
            ReverseSwapEvent::InvoicePaid { id } => self.reverse_invoice_paid(&id).await,
            ReverseSwapEvent::MinerFeeInvoicePaid { id } => {
                self.reverse_minerfee_paid(&id).await
            }
            ReverseSwapEvent::InvoiceExpired { id } => self.reverse_invoice_expired(&id).await,
            ReverseSwapEvent::ServerLockupConfirmed { id } => {
                self.reverse_server_lockup_confirmed(&id).await
            }
            ReverseSwapEvent::Claimed { id, preimage } => self.reverse_claimed(&id, preimage).await,
            ReverseSwapEvent::Expired { id } => self.reverse_expired(&id).await,
            ReverseSwapEvent::RefundConfirmed { id } => self.reverse_refund_confirmed(&id).await,
            ReverseSwapEvent::LockupFailedToSend { id, reason } => {
                self.reverse_lockup_failed_to_send(&id, reason).await
            }
        };

        if let Err(err) = result {
            tracing::error!(swap_id = %id, error = %format!("{err:#}"), "reverse handler failed");
            self.emit(NurseryEvent::Alert {
                id: Some(id),
                message: format!("{err:#}"),
            });
        }
    }

    fn reverse_lightning_client(&self, swap: &ReverseSwap) -> Result<Arc<dyn LightningClient>> {
        let currency = self.currency(&swap.lightning_currency)?;
        currency
            .lightning
            .iter()
            .find(|c| c.id() == swap.node)
            .or_else(|| currency.lightning.first())
            .cloned()
            .with_context(|| format!("no lightning client for {}", swap.lightning_currency))
    }

    async fn reverse_invoice_paid(&self, id: &str) -> Result<()> {
        let swap = self.get_reverse(id)?;
        if swap.status.is_final(SwapKind::ReverseSubmarine) {
            return Ok(());
        }
        // With a prepay attached, both invoices have to be held before the
        // server commits funds.
        if swap.miner_fee_invoice.is_some() && swap.status == SwapUpdateEvent::SwapCreated {
            tracing::debug!(swap_id = %id, "waiting for prepay minerfee invoice");
            return Ok(());
        }
        self.lock_up_reverse(&swap).await
    }

    async fn reverse_minerfee_paid(&self, id: &str) -> Result<()> {
        let swap = self.get_reverse(id)?;
        if swap.status.is_final(SwapKind::ReverseSubmarine) {
            return Ok(());
        }
        if self.advance_reverse(id, SwapUpdateEvent::MinerFeePaid)? {
            self.emit(NurseryEvent::MinerFeePaid { id: id.to_string() });
        }

        // The main invoice may have been accepted before the prepay; check
        // and drive the lockup if so.
        let client = self.reverse_lightning_client(&swap)?;
        let preimage_hash = decode_hash(&swap.preimage_hash)?;
        match race_call(
            client.lookup_hold_invoice(&preimage_hash),
            self.lightning_timeout,
        )
        .await
        {
            Ok(invoice) if invoice.state == InvoiceState::Accepted => {
                let swap = self.get_reverse(id)?;
                self.lock_up_reverse(&swap).await
            }
            Ok(_) => Ok(()),
            Err(LightningError::NotFound) => {
                tracing::debug!(swap_id = %id, "main hold invoice not found yet");
                Ok(())
            }
            Err(err) => Err(err).context("lookup main hold invoice"),
        }
    }

    async fn lock_up_reverse(&self, swap: &ReverseSwap) -> Result<()> {
        if swap.transaction_id.is_some() {
            tracing::warn!(
                swap_id = %swap.id,
                "Prevented reverse swap from sending a second lockup"
            );
            return Ok(());
        }

        match self.send_reverse_lockup(swap).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(swap_id = %swap.id, error = %format!("{err:#}"), "reverse lockup failed");
                self.handle_reverse_send_failure(swap, &format!("{err:#}")).await
            }
        }
    }

    async fn send_reverse_lockup(&self, swap: &ReverseSwap) -> Result<()> {
        let (base, quote) = split_pair(&swap.pair)?;
        let chain_symbol = chain_currency(base, quote, swap.order_side, true);
        let currency = self.currency(chain_symbol)?;
        let preimage_hash = decode_hash(&swap.preimage_hash)?;

        if currency.currency_type.is_utxo_based() {
            let chain_client = currency
                .chain_client
                .as_ref()
                .with_context(|| format!("{chain_symbol} has no chain client"))?;
            let wallet = currency
                .wallet
                .as_ref()
                .with_context(|| format!("{chain_symbol} has no wallet"))?;

            // A paid prepay invoice fixes the feerate the user already paid
            // for; without one, ask the estimator.
            let fee_per_vbyte = if let Some(miner_fee_invoice) = &swap.miner_fee_invoice {
                let amount_msat = amount_msat_from_bolt11(miner_fee_invoice)?
                    .context("prepay invoice carries no amount")?;
                prepay_fee_per_vbyte(amount_msat)
            } else {
                chain_client
                    .estimate_fee(Some(self.config.reverse_swap_mempool_eta))
                    .await
                    .context("estimate lockup fee")?
            };

            let label = lockup_label(SwapKind::ReverseSubmarine, &swap.id);
            let sent = wallet
                .send_to_address(
                    &swap.lockup_address,
                    swap.onchain_amount,
                    fee_per_vbyte,
                    &label,
                )
                .await
                .context("send lockup")?;

            let lockup_script = wallet
                .decode_address(&swap.lockup_address)
                .context("decode lockup address")?;
            let lockup_txid =
                Txid::from_str(&sent.transaction_id).context("parse lockup txid")?;

            // Filters so the watcher reports our own confirmation and the
            // user's claim.
            chain_client.add_input_filter(lockup_txid);
            chain_client.add_output_filter(lockup_script.clone());
            if let Some(watcher) = self
                .watchers
                .read()
                .expect("watcher registry poisoned")
                .get(chain_symbol)
            {
                watcher.watch_server_lockup(
                    &swap.id,
                    SwapKind::ReverseSubmarine,
                    lockup_script,
                    lockup_txid,
                    preimage_hash,
                    swap.timeout_block_height,
                );
            }

            {
                let mut store = self.store.lock().expect("store mutex poisoned");
                store.set_reverse_swap_lockup_transaction(
                    &swap.id,
                    &sent.transaction_id,
                    sent.vout,
                    sent.fee,
                )?;
                store.add_transaction_label(&sent.transaction_id, chain_symbol, &label)?;
            }

            tracing::info!(
                swap_id = %swap.id,
                lockup_txid = %sent.transaction_id,
                fee = sent.fee,
                "sent reverse lockup"
            );
            self.emit(NurseryEvent::CoinsSent {
                kind: SwapKind::ReverseSubmarine,
                id: swap.id.clone(),
                transaction_id: sent.transaction_id,
            });
            Ok(())
        } else {
            let manager = currency
                .ethereum
                .as_ref()
                .with_context(|| format!("{chain_symbol} has no ethereum manager"))?;
            let claim_address = swap
                .claim_address
                .as_deref()
                .context("reverse swap has no claim address")?;
            let amount_wei = amount_to_wei(swap.onchain_amount);

            let tx = match (currency.currency_type, swap.minerfee_onchain_amount) {
                (CurrencyType::Ether, Some(prepay)) => {
                    manager
                        .handler
                        .lockup_ether_prepay_minerfee(
                            &preimage_hash,
                            amount_wei,
                            amount_to_wei(prepay),
                            claim_address,
                            swap.timeout_block_height,
                        )
                        .await?
                }
                (CurrencyType::Ether, None) => {
                    manager
                        .handler
                        .lockup_ether(
                            &preimage_hash,
                            amount_wei,
                            claim_address,
                            swap.timeout_block_height,
                        )
                        .await?
                }
                (CurrencyType::Erc20, Some(prepay)) => {
                    manager
                        .handler
                        .lockup_token_prepay_minerfee(
                            &preimage_hash,
                            amount_wei,
                            amount_to_wei(prepay),
                            claim_address,
                            swap.timeout_block_height,
                        )
                        .await?
                }
                (CurrencyType::Erc20, None) => {
                    manager
                        .handler
                        .lockup_token(
                            &preimage_hash,
                            amount_wei,
                            claim_address,
                            swap.timeout_block_height,
                        )
                        .await?
                }
                (other, _) => anyhow::bail!("{other:?} is not an EVM currency"),
            };

            if let Some(watcher) = self
                .evm_watchers
                .read()
                .expect("watcher registry poisoned")
                .get(chain_symbol)
            {
                watcher.watch(
                    preimage_hash,
                    &swap.id,
                    SwapKind::ReverseSubmarine,
                    EvmLockupRole::ServerLockup,
                    swap.timeout_block_height,
                );
            }

            self.store
                .lock()
                .expect("store mutex poisoned")
                .set_reverse_swap_lockup_transaction(&swap.id, &tx.hash, 0, tx.fee())?;

            tracing::info!(swap_id = %swap.id, lockup_tx = %tx.hash, "sent reverse contract lockup");
            self.emit(NurseryEvent::CoinsSent {
                kind: SwapKind::ReverseSubmarine,
                id: swap.id.clone(),
                transaction_id: tx.hash,
            });
            Ok(())
        }
    }

    async fn handle_reverse_send_failure(&self, swap: &ReverseSwap, reason: &str) -> Result<()> {
        // The payer gets both HTLCs back.
        match self.reverse_lightning_client(swap) {
            Ok(client) => {
                if let Err(err) =
                    cancel_reverse_invoices(&client, swap, true, self.lightning_timeout).await
                {
                    tracing::error!(swap_id = %swap.id, error = %format!("{err:#}"), "cancelling hold invoices failed");
                }
            }
            Err(err) => {
                tracing::error!(swap_id = %swap.id, error = %err, "no lightning client to cancel invoices");
            }
        }

        self.advance_reverse(&swap.id, SwapUpdateEvent::TransactionFailed)?;
        self.emit(NurseryEvent::CoinsFailedToSend {
            kind: SwapKind::ReverseSubmarine,
            id: swap.id.clone(),
            reason: reason.to_string(),
        });
        self.prune_watchers(&swap.id);
        Ok(())
    }

    async fn reverse_server_lockup_confirmed(&self, id: &str) -> Result<()> {
        let swap = self.get_reverse(id)?;
        if self.advance_reverse(id, SwapUpdateEvent::TransactionConfirmed)? {
            self.emit(NurseryEvent::Transaction {
                kind: SwapKind::ReverseSubmarine,
                id: id.to_string(),
                transaction_id: swap.transaction_id.unwrap_or_default(),
                confirmed: true,
            });
        }
        Ok(())
    }

    async fn reverse_claimed(&self, id: &str, preimage: [u8; 32]) -> Result<()> {
        let swap = self.get_reverse(id)?;
        if swap.status.is_final(SwapKind::ReverseSubmarine) {
            return Ok(());
        }
        let expected = decode_hash(&swap.preimage_hash)?;
        anyhow::ensure!(
            sha256_preimage(&preimage) == expected,
            "claimed preimage does not match preimage hash"
        );
        self.settle_reverse_invoice(&swap, preimage).await
    }

    async fn settle_reverse_invoice(&self, swap: &ReverseSwap, preimage: [u8; 32]) -> Result<()> {
        let client = self.reverse_lightning_client(swap)?;

        // A submarine swap paying our own invoice would deadlock routing;
        // cancel instead of settling.
        let cyclic = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_swap_by_invoice(&swap.invoice, &swap.preimage_hash)?
            .is_some();

        if cyclic {
            tracing::info!(
                swap_id = %swap.id,
                "cyclic self-payment; cancelling hold invoice instead of settling"
            );
            let preimage_hash = decode_hash(&swap.preimage_hash)?;
            match race_call(
                client.cancel_hold_invoice(&preimage_hash),
                self.lightning_timeout,
            )
            .await
            {
                Ok(()) => {}
                Err(LightningError::NotFound) => {
                    tracing::debug!(swap_id = %swap.id, "hold invoice already gone");
                }
                Err(err) => return Err(err).context("cancel cyclic hold invoice"),
            }
        } else {
            race_call(client.settle_hold_invoice(&preimage), self.lightning_timeout)
                .await
                .context("settle hold invoice")?;
        }

        self.store
            .lock()
            .expect("store mutex poisoned")
            .set_invoice_settled(&swap.id, &hex::encode(preimage))?;
        self.emit(NurseryEvent::InvoiceSettled {
            id: swap.id.clone(),
        });
        self.prune_watchers(&swap.id);
        Ok(())
    }

    async fn reverse_invoice_expired(&self, id: &str) -> Result<()> {
        let swap = self.get_reverse(id)?;
        if swap.status.is_final(SwapKind::ReverseSubmarine) {
            return Ok(());
        }
        let client = self.reverse_lightning_client(&swap)?;
        cancel_reverse_invoices(&client, &swap, false, self.lightning_timeout).await?;
        if self.advance_reverse(id, SwapUpdateEvent::InvoiceExpired)? {
            self.emit(NurseryEvent::InvoiceExpired { id: id.to_string() });
        }
        self.prune_watchers(id);
        Ok(())
    }

    async fn reverse_expired(&self, id: &str) -> Result<()> {
        let swap = self.get_reverse(id)?;
        if swap.status.is_final(SwapKind::ReverseSubmarine) {
            return Ok(());
        }
        if swap.transaction_id.is_some() {
            // The server locked up; the HTLC timed out, so recover the
            // coins instead of just expiring.
            self.refund_reverse(&swap).await
        } else {
            if self.advance_reverse(id, SwapUpdateEvent::SwapExpired)? {
                tracing::info!(swap_id = %id, "onchain HTLC timed out");
                self.emit(NurseryEvent::Expiration {
                    kind: SwapKind::ReverseSubmarine,
                    id: id.to_string(),
                });
            }
            self.prune_watchers(id);
            Ok(())
        }
    }

    async fn refund_reverse(&self, swap: &ReverseSwap) -> Result<()> {
        let (base, quote) = split_pair(&swap.pair)?;
        let chain_symbol = chain_currency(base, quote, swap.order_side, true);
        let currency = self.currency(chain_symbol)?;
        let transaction_id = swap
            .transaction_id
            .as_deref()
            .context("refund without server lockup")?;

        let result = if currency.currency_type.is_utxo_based() {
            refund_utxo(
                &currency,
                &self.store,
                UtxoSpend {
                    kind: SwapKind::ReverseSubmarine,
                    swap_id: &swap.id,
                    version: swap.version,
                    lockup_transaction_id: transaction_id,
                    lockup_vout: swap.transaction_vout.unwrap_or(0),
                    key_index: swap.key_index,
                    redeem_script: swap.redeem_script.as_deref(),
                    their_public_key: swap.their_public_key.as_deref(),
                    timeout_block_height: swap.timeout_block_height,
                },
            )
            .await
        } else {
            let manager = currency
                .ethereum
                .as_ref()
                .with_context(|| format!("{chain_symbol} has no ethereum manager"))?;
            let preimage_hash = decode_hash(&swap.preimage_hash)?;
            refund_evm(
                &currency,
                manager,
                &self.store,
                &swap.id,
                &preimage_hash,
                transaction_id,
            )
            .await
        };

        match result {
            Ok((refund_txid, _fee)) => {
                if self.advance_reverse(&swap.id, SwapUpdateEvent::TransactionRefunded)? {
                    self.emit(NurseryEvent::Refund {
                        kind: SwapKind::ReverseSubmarine,
                        id: swap.id.clone(),
                        transaction_id: refund_txid,
                    });
                }
                Ok(())
            }
            Err(err) => {
                // No automatic retry; the swap row stays as-is for manual
                // recovery.
                self.alert(
                    Some(&swap.id),
                    format!("reverse swap refund failed: {err:#}"),
                );
                Ok(())
            }
        }
    }

    async fn reverse_refund_confirmed(&self, id: &str) -> Result<()> {
        if let Err(err) = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .set_refund_confirmed(id)
        {
            tracing::debug!(swap_id = %id, error = %err, "refund row already confirmed");
        }

        // The HTLC can no longer be claimed cooperatively; release the
        // payer.
        let swap = self.get_reverse(id)?;
        let client = self.reverse_lightning_client(&swap)?;
        cancel_reverse_invoices(&client, &swap, false, self.lightning_timeout).await?;
        self.prune_watchers(id);
        Ok(())
    }

    async fn reverse_lockup_failed_to_send(&self, id: &str, reason: String) -> Result<()> {
        let swap = self.get_reverse(id)?;
        if swap.transaction_id.is_some() {
            // A lockup is already recorded; whether a double spend is
            // impossible here is not established, so leave the state alone
            // and page the operator.
            self.alert(
                Some(id),
                format!("lockup send failure reported after lockup was recorded: {reason}"),
            );
            return Ok(());
        }
        self.handle_reverse_send_failure(&swap, &reason).await
    }

    // --- chain queue ---

    async fn handle_chain(&self, event: ChainSwapEvent) {
        let id = match &event {
            ChainSwapEvent::UserLockup { id, .. }
            | ChainSwapEvent::LockupFailed { id, .. }
            | ChainSwapEvent::ZeroConfRejected { id, .. }
            | ChainSwapEvent::ServerLockupConfirmed { id }
            | ChainSwapEvent::Claimed { id, .. }
            | ChainSwapEvent::Expired { id }
            | ChainSwapEvent::RefundConfirmed { id }
            | ChainSwapEvent::LockupFailedToSend { id, .. } => id.clone(),
        };

        let result = match event {
            ChainSwapEvent::UserLockup {
                id,
                lockup,
                confirmed,
            } => self.chain_user_lockup(&id, lockup, confirmed).await,
            ChainSwapEvent::LockupFailed { id, reason } => {
                self.chain_lockup_failed(&id, reason).await
            }
            ChainSwapEvent::ZeroConfRejected { id, reason } => {
                self.chain_zero_conf_rejected(&id, reason).await
            }
            ChainSwapEvent::ServerLockupConfirmed { id } => {
                self.chain_server_lockup_confirmed(&id).await
            }
            ChainSwapEvent::Claimed { id, preimage } => self.chain_claimed(&id, preimage).await,
            ChainSwapEvent::Expired { id } => self.chain_expired(&id).await,
            ChainSwapEvent::RefundConfirmed { id } => self.chain_refund_confirmed(&id).await,
            ChainSwapEvent::LockupFailedToSend { id, reason } => {
                self.chain_lockup_failed_to_send(&id, reason).await
            }
        };

        if let Err(err) = result {
            tracing::error!(swap_id = %id, error = %format!("{err:#}"), "chain swap handler failed");
            self.emit(NurseryEvent::Alert {
                id: Some(id),
                message: format!("{err:#}"),
            });
        }
    }

    async fn chain_user_lockup(
        &self,
        id: &str,
        lockup: ObservedLockup,
        confirmed: bool,
    ) -> Result<()> {
        let swap = self.get_chain(id)?;
        if swap.status.is_final(SwapKind::Chain) {
            return Ok(());
        }

        if swap.receiving.transaction_id.is_none() {
            self.store
                .lock()
                .expect("store mutex poisoned")
                .set_chain_swap_leg_transaction(
                    id,
                    false,
                    &lockup.transaction_id,
                    lockup.vout,
                    lockup.value,
                )?;
        }

        let next = if confirmed {
            SwapUpdateEvent::TransactionConfirmed
        } else {
            SwapUpdateEvent::TransactionMempool
        };
        if self.advance_chain(id, next)? {
            self.emit(NurseryEvent::Transaction {
                kind: SwapKind::Chain,
                id: id.to_string(),
                transaction_id: lockup.transaction_id.clone(),
                confirmed,
            });
        }

        let swap = self.get_chain(id)?;
        if swap.sending.transaction_id.is_some() {
            tracing::warn!(
                swap_id = %id,
                "Prevented chain swap from sending a second lockup"
            );
            return Ok(());
        }

        match self.send_chain_lockup(&swap).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(swap_id = %id, error = %format!("{err:#}"), "chain swap lockup failed");
                self.advance_chain(id, SwapUpdateEvent::TransactionFailed)?;
                self.emit(NurseryEvent::CoinsFailedToSend {
                    kind: SwapKind::Chain,
                    id: id.to_string(),
                    reason: format!("{err:#}"),
                });
                self.prune_watchers(id);
                Ok(())
            }
        }
    }

    async fn send_chain_lockup(&self, swap: &ChainSwap) -> Result<()> {
        let leg = &swap.sending;
        let currency = self.currency(&leg.symbol)?;
        let preimage_hash = decode_hash(&swap.preimage_hash)?;

        if currency.currency_type.is_utxo_based() {
            let chain_client = currency
                .chain_client
                .as_ref()
                .with_context(|| format!("{} has no chain client", leg.symbol))?;
            let wallet = currency
                .wallet
                .as_ref()
                .with_context(|| format!("{} has no wallet", leg.symbol))?;

            let fee_per_vbyte = chain_client
                .estimate_fee(Some(self.config.reverse_swap_mempool_eta))
                .await
                .context("estimate lockup fee")?;

            let label = lockup_label(SwapKind::Chain, &swap.id);
            let sent = wallet
                .send_to_address(
                    &leg.lockup_address,
                    leg.expected_amount,
                    fee_per_vbyte,
                    &label,
                )
                .await
                .context("send lockup")?;

            let lockup_script = wallet
                .decode_address(&leg.lockup_address)
                .context("decode lockup address")?;
            let lockup_txid =
                Txid::from_str(&sent.transaction_id).context("parse lockup txid")?;

            chain_client.add_input_filter(lockup_txid);
            chain_client.add_output_filter(lockup_script.clone());
            if let Some(watcher) = self
                .watchers
                .read()
                .expect("watcher registry poisoned")
                .get(leg.symbol.as_str())
            {
                watcher.watch_server_lockup(
                    &swap.id,
                    SwapKind::Chain,
                    lockup_script,
                    lockup_txid,
                    preimage_hash,
                    leg.timeout_block_height,
                );
            }

            {
                let mut store = self.store.lock().expect("store mutex poisoned");
                store.set_chain_swap_leg_transaction(
                    &swap.id,
                    true,
                    &sent.transaction_id,
                    sent.vout,
                    leg.expected_amount,
                )?;
                store.add_transaction_label(&sent.transaction_id, &leg.symbol, &label)?;
            }
            self.advance_chain(&swap.id, SwapUpdateEvent::TransactionServerMempool)?;

            tracing::info!(
                swap_id = %swap.id,
                lockup_txid = %sent.transaction_id,
                fee = sent.fee,
                "sent chain swap lockup"
            );
            self.emit(NurseryEvent::CoinsSent {
                kind: SwapKind::Chain,
                id: swap.id.clone(),
                transaction_id: sent.transaction_id,
            });
            Ok(())
        } else {
            let manager = currency
                .ethereum
                .as_ref()
                .with_context(|| format!("{} has no ethereum manager", leg.symbol))?;
            let claim_address = leg
                .claim_address
                .as_deref()
                .context("sending leg has no claim address")?;
            let amount = amount_to_wei(leg.expected_amount);

            let tx = match currency.currency_type {
                CurrencyType::Ether => {
                    manager
                        .handler
                        .lockup_ether(
                            &preimage_hash,
                            amount,
                            claim_address,
                            leg.timeout_block_height,
                        )
                        .await?
                }
                CurrencyType::Erc20 => {
                    manager
                        .handler
                        .lockup_token(
                            &preimage_hash,
                            amount,
                            claim_address,
                            leg.timeout_block_height,
                        )
                        .await?
                }
                other => anyhow::bail!("{other:?} is not an EVM currency"),
            };

            if let Some(watcher) = self
                .evm_watchers
                .read()
                .expect("watcher registry poisoned")
                .get(leg.symbol.as_str())
            {
                watcher.watch(
                    preimage_hash,
                    &swap.id,
                    SwapKind::Chain,
                    EvmLockupRole::ServerLockup,
                    leg.timeout_block_height,
                );
            }

            self.store
                .lock()
                .expect("store mutex poisoned")
                .set_chain_swap_leg_transaction(
                    &swap.id,
                    true,
                    &tx.hash,
                    0,
                    leg.expected_amount,
                )?;
            self.advance_chain(&swap.id, SwapUpdateEvent::TransactionServerMempool)?;

            tracing::info!(swap_id = %swap.id, lockup_tx = %tx.hash, "sent chain swap contract lockup");
            self.emit(NurseryEvent::CoinsSent {
                kind: SwapKind::Chain,
                id: swap.id.clone(),
                transaction_id: tx.hash,
            });
            Ok(())
        }
    }

    async fn chain_server_lockup_confirmed(&self, id: &str) -> Result<()> {
        let swap = self.get_chain(id)?;
        if self.advance_chain(id, SwapUpdateEvent::TransactionServerConfirmed)? {
            self.emit(NurseryEvent::Transaction {
                kind: SwapKind::Chain,
                id: id.to_string(),
                transaction_id: swap.sending.transaction_id.unwrap_or_default(),
                confirmed: true,
            });
        }
        Ok(())
    }

    async fn chain_claimed(&self, id: &str, preimage: [u8; 32]) -> Result<()> {
        let swap = self.get_chain(id)?;
        if swap.status.is_final(SwapKind::Chain) {
            return Ok(());
        }
        let expected = decode_hash(&swap.preimage_hash)?;
        anyhow::ensure!(
            sha256_preimage(&preimage) == expected,
            "claimed preimage does not match preimage hash"
        );
        self.store
            .lock()
            .expect("store mutex poisoned")
            .set_chain_swap_preimage(id, &hex::encode(preimage))?;
        self.attempt_settle_chain(&swap, preimage).await
    }

    async fn attempt_settle_chain(&self, swap: &ChainSwap, preimage: [u8; 32]) -> Result<()> {
        let expected = decode_hash(&swap.preimage_hash)?;
        anyhow::ensure!(
            sha256_preimage(&preimage) == expected,
            "preimage does not match preimage hash"
        );

        if let Some(claimer) = &self.claimer
            && claimer.defer(SwapKind::Chain, &swap.id, preimage).await
        {
            if self.advance_chain(&swap.id, SwapUpdateEvent::TransactionClaimPending)? {
                self.emit(NurseryEvent::ClaimPending {
                    kind: SwapKind::Chain,
                    id: swap.id.clone(),
                });
            }
            return Ok(());
        }

        let leg = &swap.receiving;
        let currency = self.currency(&leg.symbol)?;
        let lockup_transaction_id = leg
            .transaction_id
            .as_deref()
            .context("no user lockup recorded")?;

        let (transaction_id, fee) = if currency.currency_type.is_utxo_based() {
            claim_utxo(
                &currency,
                &self.store,
                UtxoSpend {
                    kind: SwapKind::Chain,
                    swap_id: &swap.id,
                    version: swap.version,
                    lockup_transaction_id,
                    lockup_vout: leg.transaction_vout.unwrap_or(0),
                    key_index: leg.key_index,
                    redeem_script: leg.redeem_script.as_deref(),
                    their_public_key: leg.their_public_key.as_deref(),
                    timeout_block_height: leg.timeout_block_height,
                },
                preimage,
            )
            .await?
        } else {
            let tx = self
                .claim_evm(&currency, &preimage, lockup_transaction_id)
                .await?;
            (tx.hash.clone(), tx.fee())
        };

        {
            let mut store = self.store.lock().expect("store mutex poisoned");
            store.set_claim_miner_fee(&swap.id, fee)?;
        }
        if self.advance_chain(&swap.id, SwapUpdateEvent::TransactionClaimed)? {
            self.emit(NurseryEvent::Claim {
                kind: SwapKind::Chain,
                id: swap.id.clone(),
                transaction_id,
            });
        }
        self.prune_watchers(&swap.id);
        Ok(())
    }

    async fn chain_lockup_failed(&self, id: &str, reason: String) -> Result<()> {
        if self.advance_chain(id, SwapUpdateEvent::TransactionLockupFailed)? {
            self.emit(NurseryEvent::LockupFailed {
                kind: SwapKind::Chain,
                id: id.to_string(),
                reason,
            });
        }
        self.prune_watchers(id);
        Ok(())
    }

    async fn chain_zero_conf_rejected(&self, id: &str, reason: String) -> Result<()> {
        if self.advance_chain(id, SwapUpdateEvent::TransactionZeroConfRejected)? {
            self.emit(NurseryEvent::ZeroConfRejected {
                kind: SwapKind::Chain,
                id: id.to_string(),
                reason,
            });
        }
        Ok(())
    }

    async fn chain_expired(&self, id: &str) -> Result<()> {
        let swap = self.get_chain(id)?;
        if swap.status.is_final(SwapKind::Chain) {
            return Ok(());
        }
        if swap.sending.transaction_id.is_some() {
            self.refund_chain(&swap).await
        } else {
            if self.advance_chain(id, SwapUpdateEvent::SwapExpired)? {
                tracing::info!(swap_id = %id, "onchain HTLC timed out");
                self.emit(NurseryEvent::Expiration {
                    kind: SwapKind::Chain,
                    id: id.to_string(),
                });
            }
            self.prune_watchers(id);
            Ok(())
        }
    }

    async fn refund_chain(&self, swap: &ChainSwap) -> Result<()> {
        let leg = &swap.sending;
        let currency = self.currency(&leg.symbol)?;
        let transaction_id = leg
            .transaction_id
            .as_deref()
            .context("refund without server lockup")?;

        let result = if currency.currency_type.is_utxo_based() {
            refund_utxo(
                &currency,
                &self.store,
                UtxoSpend {
                    kind: SwapKind::Chain,
                    swap_id: &swap.id,
                    version: swap.version,
                    lockup_transaction_id: transaction_id,
                    lockup_vout: leg.transaction_vout.unwrap_or(0),
                    key_index: leg.key_index,
                    redeem_script: leg.redeem_script.as_deref(),
                    their_public_key: leg.their_public_key.as_deref(),
                    timeout_block_height: leg.timeout_block_height,
                },
            )
            .await
        } else {
            let manager = currency
                .ethereum
                .as_ref()
                .with_context(|| format!("{} has no ethereum manager", leg.symbol))?;
            let preimage_hash = decode_hash(&swap.preimage_hash)?;
            refund_evm(
                &currency,
                manager,
                &self.store,
                &swap.id,
                &preimage_hash,
                transaction_id,
            )
            .await
        };

        match result {
            Ok((refund_txid, _fee)) => {
                if self.advance_chain(&swap.id, SwapUpdateEvent::TransactionRefunded)? {
                    self.emit(NurseryEvent::Refund {
                        kind: SwapKind::Chain,
                        id: swap.id.clone(),
                        transaction_id: refund_txid,
                    });
                }
                Ok(())
            }
            Err(err) => {
                self.alert(Some(&swap.id), format!("chain swap refund failed: {err:#}"));
                Ok(())
            }
        }
    }

    async fn chain_refund_confirmed(&self, id: &str) -> Result<()> {
        if let Err(err) = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .set_refund_confirmed(id)
        {
            tracing::debug!(swap_id = %id, error = %err, "refund row already confirmed");
        }
        self.prune_watchers(id);
        Ok(())
    }

    async fn chain_lockup_failed_to_send(&self, id: &str, reason: String) -> Result<()> {
        let swap = self.get_chain(id)?;
        if swap.sending.transaction_id.is_some() {
            self.alert(
                Some(id),
                format!("lockup send failure reported after lockup was recorded: {reason}"),
            );
            return Ok(());
        }
        self.advance_chain(id, SwapUpdateEvent::TransactionFailed)?;
        self.emit(NurseryEvent::CoinsFailedToSend {
            kind: SwapKind::Chain,
            id: id.to_string(),
            reason,
        });
        self.prune_watchers(id);
        Ok(())
    }
}

fn decode_hash(hex_str: &str) -> Result<[u8; 32]> {
    hex::decode(hex_str)
        .context("decode hash hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("hash must be 32 bytes"))
}
