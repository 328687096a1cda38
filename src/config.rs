use serde::{Deserialize, Serialize};

/// Tuning knobs of the nursery. Everything has a workable default so a bare
/// `NurseryConfig::default()` runs on regtest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NurseryConfig {
    /// Interval of the settlement retry timer in seconds. `0` disables it.
    pub retry_interval_secs: u64,

    /// Upper bound on a single submarine payment attempt.
    pub payment_timeout_minutes: u64,

    /// Every Lightning RPC is raced against this timeout.
    pub lightning_client_call_timeout_ms: u64,

    /// Depth of each per-kind event queue. Watchers block (backpressure)
    /// once a queue is full.
    pub event_queue_depth: usize,

    /// Poll interval of the refund confirmation watcher in seconds.
    pub refund_poll_interval_secs: u64,

    /// Confirmations a refund broadcast needs before hold invoices are
    /// cancelled.
    pub refund_confirmation_target: u32,

    /// Poll interval of the hold-invoice expiry watcher in seconds.
    pub invoice_poll_interval_secs: u64,

    /// Fee estimator target for server lockups without a prepay invoice.
    pub reverse_swap_mempool_eta: u32,
}

impl Default for NurseryConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 15,
            payment_timeout_minutes: 2,
            lightning_client_call_timeout_ms: 10_000,
            event_queue_depth: 10_000,
            refund_poll_interval_secs: 30,
            refund_confirmation_target: 1,
            invoice_poll_interval_secs: 10,
            reverse_swap_mempool_eta: 2,
        }
    }
}
