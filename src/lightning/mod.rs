pub mod invoice;
pub mod watcher;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

/// States a hold invoice moves through on the Lightning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    Open,
    Accepted,
    Settled,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtlcState {
    Accepted,
    Settled,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct HoldInvoice {
    pub state: InvoiceState,
    pub htlcs: Vec<HtlcState>,
}

/// Errors the adapter must map node-specific failures onto. The core pattern
/// matches on these; it never inspects error strings.
#[derive(Debug, thiserror::Error)]
pub enum LightningError {
    /// The invoice does not (or no longer does) exist on the node.
    #[error("invoice not found")]
    NotFound,
    #[error("lightning call timed out")]
    Timeout,
    #[error("payment failed permanently: {0}")]
    PaymentPermanent(String),
    #[error("lightning rpc: {0}")]
    Rpc(String),
}

pub type LightningResult<T> = Result<T, LightningError>;

#[derive(Debug, Clone, Default)]
pub struct PayOptions {
    pub timeout: Option<Duration>,
    pub outgoing_channel_id: Option<String>,
    pub max_fee_msat: Option<u64>,
}

/// Hold-invoice state transition pushed by the node.
#[derive(Debug, Clone)]
pub struct HoldInvoiceUpdate {
    pub preimage_hash: [u8; 32],
    pub state: InvoiceState,
}

#[async_trait]
pub trait LightningClient: Send + Sync {
    /// Stable identifier of the node, matched against `ReverseSwap::node`.
    fn id(&self) -> &str;

    fn symbol(&self) -> &str;

    /// Pays `invoice` and returns the preimage on success. Implementations
    /// must return `PaymentPermanent` only for failures that cannot succeed
    /// on retry.
    async fn pay(&self, invoice: &str, options: PayOptions) -> LightningResult<[u8; 32]>;

    async fn add_hold_invoice(
        &self,
        amount_msat: u64,
        preimage_hash: &[u8; 32],
        expiry_secs: u32,
        memo: &str,
    ) -> LightningResult<String>;

    async fn settle_hold_invoice(&self, preimage: &[u8; 32]) -> LightningResult<()>;

    async fn cancel_hold_invoice(&self, preimage_hash: &[u8; 32]) -> LightningResult<()>;

    async fn lookup_hold_invoice(&self, preimage_hash: &[u8; 32]) -> LightningResult<HoldInvoice>;

    /// Hold-invoice transition stream; a single consumer (the watcher)
    /// subscribes.
    fn subscribe_hold_invoices(&self) -> tokio::sync::mpsc::UnboundedReceiver<HoldInvoiceUpdate>;
}

/// Races a Lightning call against `timeout`. On timeout the local state is
/// untouched and the caller gets `LightningError::Timeout`.
pub async fn race_call<T, F>(call: F, timeout: Duration) -> LightningResult<T>
where
    F: Future<Output = LightningResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(LightningError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn race_call_times_out() {
        let pending = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        };
        let err = race_call(pending, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, LightningError::Timeout));
    }

    #[tokio::test]
    async fn race_call_passes_through() {
        let value = race_call(async { Ok(21u32) }, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value, 21);
    }
}
