use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::mpsc;

use super::invoice::{is_expired_bolt11, payment_hash_from_bolt11};
use super::{HoldInvoiceUpdate, InvoiceState, LightningClient, LightningError, race_call};
use crate::config::NurseryConfig;
use crate::nursery::events::ReverseSwapEvent;
use crate::swap::store::SqliteStore;
use crate::swap::{ReverseSwap, SwapUpdateEvent};

/// Watches hold-invoice transitions across all Lightning nodes and reports
/// acceptance of main and prepay invoices into the reverse-swap queue.
pub struct LightningWatcher {
    store: Arc<Mutex<SqliteStore>>,
    clients: Vec<Arc<dyn LightningClient>>,
    reverse_tx: mpsc::Sender<ReverseSwapEvent>,
}

impl LightningWatcher {
    pub fn new(
        store: Arc<Mutex<SqliteStore>>,
        clients: Vec<Arc<dyn LightningClient>>,
        reverse_tx: mpsc::Sender<ReverseSwapEvent>,
    ) -> Self {
        Self {
            store,
            clients,
            reverse_tx,
        }
    }

    pub fn spawn(self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for client in &self.clients {
            let mut updates = client.subscribe_hold_invoices();
            let store = self.store.clone();
            let reverse_tx = self.reverse_tx.clone();
            let node = client.id().to_string();
            handles.push(tokio::spawn(async move {
                while let Some(update) = updates.recv().await {
                    if let Err(err) = handle_update(&store, &reverse_tx, &update).await {
                        tracing::error!(node = %node, error = %err, "hold invoice update failed");
                    }
                }
            }));
        }
        handles
    }
}

async fn handle_update(
    store: &Arc<Mutex<SqliteStore>>,
    reverse_tx: &mpsc::Sender<ReverseSwapEvent>,
    update: &HoldInvoiceUpdate,
) -> Result<()> {
    if update.state != InvoiceState::Accepted {
        return Ok(());
    }

    let hash_hex = hex::encode(update.preimage_hash);

    let main = store
        .lock()
        .expect("store mutex poisoned")
        .get_reverse_swap_by_preimage_hash(&hash_hex)?;
    if let Some(swap) = main {
        tracing::debug!(swap_id = %swap.id, "hold invoice accepted");
        let _ = reverse_tx
            .send(ReverseSwapEvent::InvoicePaid { id: swap.id })
            .await;
        return Ok(());
    }

    // Not a main invoice; it might be the prepay of a pending reverse swap.
    let pending = store
        .lock()
        .expect("store mutex poisoned")
        .get_reverse_swaps_with_status(&[SwapUpdateEvent::SwapCreated])?;
    for swap in pending {
        let Some(miner_fee_invoice) = &swap.miner_fee_invoice else {
            continue;
        };
        if payment_hash_from_bolt11(miner_fee_invoice)? == update.preimage_hash {
            tracing::debug!(swap_id = %swap.id, "prepay minerfee invoice accepted");
            let _ = reverse_tx
                .send(ReverseSwapEvent::MinerFeeInvoicePaid { id: swap.id })
                .await;
            return Ok(());
        }
    }

    Ok(())
}

/// Cancels the hold invoices of a reverse swap. `is_send_failure` refunds the
/// prepay to the payer; otherwise a prepay whose preimage we hold is settled,
/// since the miner fee it paid for was spent.
pub async fn cancel_reverse_invoices(
    client: &Arc<dyn LightningClient>,
    swap: &ReverseSwap,
    is_send_failure: bool,
    timeout: Duration,
) -> Result<()> {
    let preimage_hash: [u8; 32] = hex::decode(&swap.preimage_hash)
        .context("decode preimage_hash")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("preimage_hash must be 32 bytes"))?;

    cancel_quietly(client, &preimage_hash, timeout, &swap.id).await?;

    if let Some(miner_fee_invoice) = &swap.miner_fee_invoice {
        let minerfee_hash = payment_hash_from_bolt11(miner_fee_invoice)?;

        if !is_send_failure
            && let Some(preimage_hex) = &swap.miner_fee_invoice_preimage
        {
            let preimage: [u8; 32] = hex::decode(preimage_hex)
                .context("decode minerfee preimage")?
                .try_into()
                .map_err(|_| anyhow::anyhow!("minerfee preimage must be 32 bytes"))?;
            match race_call(client.settle_hold_invoice(&preimage), timeout).await {
                Ok(()) => return Ok(()),
                Err(LightningError::NotFound) => {
                    tracing::debug!(swap_id = %swap.id, "minerfee invoice already gone");
                    return Ok(());
                }
                Err(err) => return Err(err).context("settle minerfee invoice"),
            }
        }

        cancel_quietly(client, &minerfee_hash, timeout, &swap.id).await?;
    }

    Ok(())
}

async fn cancel_quietly(
    client: &Arc<dyn LightningClient>,
    preimage_hash: &[u8; 32],
    timeout: Duration,
    swap_id: &str,
) -> Result<()> {
    match race_call(client.cancel_hold_invoice(preimage_hash), timeout).await {
        Ok(()) => Ok(()),
        // Common on regtest where invoices are torn down with the node.
        Err(LightningError::NotFound) => {
            tracing::debug!(swap_id = %swap_id, "hold invoice already gone");
            Ok(())
        }
        Err(err) => Err(err).context("cancel hold invoice"),
    }
}

/// Polls unpaid hold invoices for expiry and reports `invoice.expired`.
pub struct InvoiceWatcher {
    store: Arc<Mutex<SqliteStore>>,
    poll_interval: Duration,
    reverse_tx: mpsc::Sender<ReverseSwapEvent>,
}

impl InvoiceWatcher {
    pub fn new(
        store: Arc<Mutex<SqliteStore>>,
        config: &NurseryConfig,
        reverse_tx: mpsc::Sender<ReverseSwapEvent>,
    ) -> Self {
        Self {
            store,
            poll_interval: Duration::from_secs(config.invoice_poll_interval_secs),
            reverse_tx,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.poll_interval);
            loop {
                timer.tick().await;
                if let Err(err) = self.poll_once().await {
                    tracing::error!(error = %err, "invoice watcher poll failed");
                }
            }
        })
    }

    async fn poll_once(&self) -> Result<()> {
        // Only invoices that were never accepted can still expire.
        let pending = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_reverse_swaps_with_status(&[
                SwapUpdateEvent::SwapCreated,
                SwapUpdateEvent::MinerFeePaid,
            ])?;

        for swap in pending {
            match is_expired_bolt11(&swap.invoice) {
                Ok(true) => {
                    tracing::debug!(swap_id = %swap.id, "hold invoice expired");
                    let _ = self
                        .reverse_tx
                        .send(ReverseSwapEvent::InvoiceExpired { id: swap.id })
                        .await;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(swap_id = %swap.id, error = %err, "invoice expiry check failed");
                }
            }
        }

        Ok(())
    }
}
