use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::config::NurseryConfig;
use crate::currency::Currency;
use crate::lightning::{LightningClient, LightningError, PayOptions, race_call};
use crate::swap::store::SqliteStore;
use crate::swap::{ChannelCreation, Submarine, SwapUpdateEvent};
use crate::utxo::sha256_preimage;

/// Picks the Lightning node to pay through. The preferred node is used when
/// it serves the currency; otherwise the first candidate wins.
#[derive(Debug, Clone, Default)]
pub struct NodeSwitch {
    pub preferred_node: Option<String>,
}

impl NodeSwitch {
    pub fn select(&self, currency: &Currency) -> Option<Arc<dyn LightningClient>> {
        if let Some(preferred) = &self.preferred_node
            && let Some(client) = currency.lightning.iter().find(|c| c.id() == preferred)
        {
            return Some(client.clone());
        }
        currency.lightning.first().cloned()
    }
}

/// Opens the channel a submarine swap with an attached channel creation
/// request needs before its invoice can be paid.
#[async_trait]
pub trait ChannelNursery: Send + Sync {
    async fn open_channel(&self, swap: &Submarine, creation: &ChannelCreation) -> Result<()>;
}

pub struct PaymentHandler {
    store: Arc<Mutex<SqliteStore>>,
    node_switch: NodeSwitch,
    channel_nursery: Option<Arc<dyn ChannelNursery>>,
    payment_timeout: Duration,
}

impl PaymentHandler {
    pub fn new(
        store: Arc<Mutex<SqliteStore>>,
        node_switch: NodeSwitch,
        channel_nursery: Option<Arc<dyn ChannelNursery>>,
        config: &NurseryConfig,
    ) -> Self {
        Self {
            store,
            node_switch,
            channel_nursery,
            payment_timeout: Duration::from_secs(config.payment_timeout_minutes * 60),
        }
    }

    /// Pays the swap invoice. `Ok(None)` means the payment is still in
    /// flight and the retry timer should re-drive it; an error is permanent.
    pub async fn pay_invoice(
        &self,
        currency: &Currency,
        swap: &Submarine,
        outgoing_channel_id: Option<String>,
    ) -> Result<Option<[u8; 32]>> {
        let invoice = swap
            .invoice
            .as_deref()
            .context("swap has no invoice to pay")?;

        let channel_creation = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_channel_creation(&swap.id)?;
        if let Some(creation) = channel_creation
            && creation.funding_transaction_id.is_none()
        {
            let nursery = self
                .channel_nursery
                .as_ref()
                .context("channel creation requested but no channel nursery")?;
            nursery
                .open_channel(swap, &creation)
                .await
                .context("open channel")?;
            // The channel is funding; the payment is retried once it
            // confirms.
            return Ok(None);
        }

        let client = self
            .node_switch
            .select(currency)
            .with_context(|| format!("no lightning client for {}", currency.symbol))?;

        if !matches!(
            swap.status,
            SwapUpdateEvent::InvoicePending | SwapUpdateEvent::InvoicePaid
        ) {
            self.store
                .lock()
                .expect("store mutex poisoned")
                .set_swap_status(&swap.id, SwapUpdateEvent::InvoicePending)?;
        }

        tracing::debug!(swap_id = %swap.id, node = client.id(), "paying invoice");

        let options = PayOptions {
            timeout: Some(self.payment_timeout),
            outgoing_channel_id,
            max_fee_msat: None,
        };
        let preimage = match race_call(client.pay(invoice, options), self.payment_timeout).await {
            Ok(preimage) => preimage,
            Err(LightningError::Timeout) => {
                tracing::warn!(swap_id = %swap.id, "invoice payment still in flight");
                return Ok(None);
            }
            Err(LightningError::PaymentPermanent(reason)) => {
                anyhow::bail!("invoice payment failed permanently: {reason}");
            }
            Err(err) => {
                // Transient RPC failures are retried by the timer.
                tracing::warn!(swap_id = %swap.id, error = %err, "invoice payment errored");
                return Ok(None);
            }
        };

        let expected: [u8; 32] = hex::decode(&swap.preimage_hash)
            .context("decode preimage_hash")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("preimage_hash must be 32 bytes"))?;
        anyhow::ensure!(
            sha256_preimage(&preimage) == expected,
            "preimage hash mismatch for swap {}",
            swap.id
        );

        self.store
            .lock()
            .expect("store mutex poisoned")
            .set_swap_status(&swap.id, SwapUpdateEvent::InvoicePaid)?;

        Ok(Some(preimage))
    }
}
