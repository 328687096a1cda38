use crate::swap::SwapKind;

/// A lockup (or server lockup) a watcher matched on chain.
#[derive(Debug, Clone)]
pub struct ObservedLockup {
    pub transaction_id: String,
    pub vout: u32,
    pub value: u64,
}

/// Events processed by the submarine queue.
#[derive(Debug, Clone)]
pub enum SubmarineEvent {
    Lockup {
        id: String,
        lockup: ObservedLockup,
        confirmed: bool,
    },
    LockupFailed {
        id: String,
        reason: String,
    },
    ZeroConfRejected {
        id: String,
        reason: String,
    },
    Expired {
        id: String,
    },
    /// Fired by the retry timer for swaps stuck in invoice.pending/paid.
    RetrySettle {
        id: String,
    },
}

/// Events processed by the reverse-swap queue.
#[derive(Debug, Clone)]
pub enum ReverseSwapEvent {
    InvoicePaid { id: String },
    MinerFeeInvoicePaid { id: String },
    InvoiceExpired { id: String },
    ServerLockupConfirmed { id: String },
    Claimed { id: String, preimage: [u8; 32] },
    Expired { id: String },
    RefundConfirmed { id: String },
    LockupFailedToSend { id: String, reason: String },
}

/// Events processed by the chain-swap queue.
#[derive(Debug, Clone)]
pub enum ChainSwapEvent {
    UserLockup {
        id: String,
        lockup: ObservedLockup,
        confirmed: bool,
    },
    LockupFailed {
        id: String,
        reason: String,
    },
    ZeroConfRejected {
        id: String,
        reason: String,
    },
    ServerLockupConfirmed {
        id: String,
    },
    Claimed {
        id: String,
        preimage: [u8; 32],
    },
    Expired {
        id: String,
    },
    RefundConfirmed {
        id: String,
    },
    LockupFailedToSend {
        id: String,
        reason: String,
    },
}

/// Everything the nursery reports upward to the outer server.
#[derive(Debug, Clone)]
pub enum NurseryEvent {
    Transaction {
        kind: SwapKind,
        id: String,
        transaction_id: String,
        confirmed: bool,
    },
    ZeroConfRejected {
        kind: SwapKind,
        id: String,
        reason: String,
    },
    Claim {
        kind: SwapKind,
        id: String,
        transaction_id: String,
    },
    ClaimPending {
        kind: SwapKind,
        id: String,
    },
    Expiration {
        kind: SwapKind,
        id: String,
    },
    InvoiceExpired {
        id: String,
    },
    InvoiceSettled {
        id: String,
    },
    CoinsSent {
        kind: SwapKind,
        id: String,
        transaction_id: String,
    },
    CoinsFailedToSend {
        kind: SwapKind,
        id: String,
        reason: String,
    },
    LockupFailed {
        kind: SwapKind,
        id: String,
        reason: String,
    },
    Refund {
        kind: SwapKind,
        id: String,
        transaction_id: String,
    },
    MinerFeePaid {
        id: String,
    },
    /// Operator notification for conditions that need manual action.
    Alert {
        id: Option<String>,
        message: String,
    },
}
