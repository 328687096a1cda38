pub mod store;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapKind {
    Submarine,
    ReverseSubmarine,
    Chain,
}

/// Taproot swaps carry a serialized swap tree instead of a redeem script and
/// unlock the MuSig2 cooperative paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapVersion {
    Legacy,
    Taproot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// The persisted status column. Names follow the wire format consumed by the
/// outer server, hence the dotted strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapUpdateEvent {
    SwapCreated,
    MinerFeePaid,
    TransactionMempool,
    TransactionConfirmed,
    TransactionServerMempool,
    TransactionServerConfirmed,
    InvoicePending,
    InvoicePaid,
    InvoiceSettled,
    InvoiceExpired,
    TransactionClaimPending,
    TransactionClaimed,
    TransactionZeroConfRejected,
    TransactionLockupFailed,
    TransactionRefunded,
    TransactionFailed,
    SwapExpired,
}

impl SwapUpdateEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SwapCreated => "swap.created",
            Self::MinerFeePaid => "minerfee.paid",
            Self::TransactionMempool => "transaction.mempool",
            Self::TransactionConfirmed => "transaction.confirmed",
            Self::TransactionServerMempool => "transaction.server.mempool",
            Self::TransactionServerConfirmed => "transaction.server.confirmed",
            Self::InvoicePending => "invoice.pending",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoiceSettled => "invoice.settled",
            Self::InvoiceExpired => "invoice.expired",
            Self::TransactionClaimPending => "transaction.claim.pending",
            Self::TransactionClaimed => "transaction.claimed",
            Self::TransactionZeroConfRejected => "transaction.zeroconf.rejected",
            Self::TransactionLockupFailed => "transaction.lockupFailed",
            Self::TransactionRefunded => "transaction.refunded",
            Self::TransactionFailed => "transaction.failed",
            Self::SwapExpired => "swap.expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "swap.created" => Self::SwapCreated,
            "minerfee.paid" => Self::MinerFeePaid,
            "transaction.mempool" => Self::TransactionMempool,
            "transaction.confirmed" => Self::TransactionConfirmed,
            "transaction.server.mempool" => Self::TransactionServerMempool,
            "transaction.server.confirmed" => Self::TransactionServerConfirmed,
            "invoice.pending" => Self::InvoicePending,
            "invoice.paid" => Self::InvoicePaid,
            "invoice.settled" => Self::InvoiceSettled,
            "invoice.expired" => Self::InvoiceExpired,
            "transaction.claim.pending" => Self::TransactionClaimPending,
            "transaction.claimed" => Self::TransactionClaimed,
            "transaction.zeroconf.rejected" => Self::TransactionZeroConfRejected,
            "transaction.lockupFailed" => Self::TransactionLockupFailed,
            "transaction.refunded" => Self::TransactionRefunded,
            "transaction.failed" => Self::TransactionFailed,
            "swap.expired" => Self::SwapExpired,
            _ => return None,
        })
    }

    /// Failure statuses may interrupt the happy path from any non-final
    /// state.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::TransactionZeroConfRejected
                | Self::TransactionLockupFailed
                | Self::TransactionRefunded
                | Self::TransactionFailed
                | Self::InvoiceExpired
                | Self::SwapExpired
        )
    }

    /// Whether no further transition out of this status exists for `kind`.
    pub fn is_final(&self, kind: SwapKind) -> bool {
        match kind {
            SwapKind::Submarine => matches!(
                self,
                Self::TransactionClaimed | Self::TransactionLockupFailed | Self::SwapExpired
            ),
            SwapKind::ReverseSubmarine => matches!(
                self,
                Self::InvoiceSettled
                    | Self::InvoiceExpired
                    | Self::SwapExpired
                    | Self::TransactionRefunded
                    | Self::TransactionFailed
            ),
            SwapKind::Chain => matches!(
                self,
                Self::TransactionClaimed
                    | Self::SwapExpired
                    | Self::TransactionRefunded
                    | Self::TransactionFailed
                    | Self::TransactionLockupFailed
            ),
        }
    }

    /// Position on the happy path of `kind`, if this status is on it.
    fn progress_rank(&self, kind: SwapKind) -> Option<u8> {
        let order: &[SwapUpdateEvent] = match kind {
            SwapKind::Submarine => &[
                Self::SwapCreated,
                Self::TransactionMempool,
                Self::TransactionConfirmed,
                Self::InvoicePending,
                Self::InvoicePaid,
                Self::TransactionClaimPending,
                Self::TransactionClaimed,
            ],
            SwapKind::ReverseSubmarine => &[
                Self::SwapCreated,
                Self::MinerFeePaid,
                Self::TransactionMempool,
                Self::TransactionConfirmed,
                Self::InvoiceSettled,
            ],
            SwapKind::Chain => &[
                Self::SwapCreated,
                Self::TransactionMempool,
                Self::TransactionConfirmed,
                Self::TransactionServerMempool,
                Self::TransactionServerConfirmed,
                Self::TransactionClaimPending,
                Self::TransactionClaimed,
            ],
        };
        order.iter().position(|s| s == self).map(|p| p as u8)
    }

    /// Transition guard: a status may only advance along the per-kind DAG.
    /// Re-applying the current status is refused (the caller treats that as
    /// an idempotent no-op), as is any backward move on the happy path.
    pub fn may_advance_to(&self, next: SwapUpdateEvent, kind: SwapKind) -> bool {
        if *self == next {
            return false;
        }
        if self.is_final(kind) {
            return false;
        }
        // A zero-conf rejection is recoverable: the confirmed lockup
        // re-enters the happy path.
        if *self == Self::TransactionZeroConfRejected {
            return true;
        }
        if next.is_failure() {
            return true;
        }
        match (self.progress_rank(kind), next.progress_rank(kind)) {
            (Some(a), Some(b)) => b > a,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submarine {
    pub id: String,
    pub pair: String,
    pub order_side: OrderSide,
    pub version: SwapVersion,
    pub invoice: Option<String>,
    /// 32-byte hex, immutable after creation.
    pub preimage_hash: String,
    pub lockup_address: String,
    pub timeout_block_height: u64,
    pub expected_amount: u64,
    pub onchain_amount: u64,
    pub lockup_transaction_id: Option<String>,
    pub lockup_transaction_vout: Option<u32>,
    pub key_index: u32,
    /// Legacy: hex redeem script. Taproot: serialized swap tree.
    pub redeem_script: Option<String>,
    pub their_public_key: Option<String>,
    pub rate: Option<f64>,
    pub status: SwapUpdateEvent,
    pub miner_fee: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseSwap {
    pub id: String,
    pub pair: String,
    pub order_side: OrderSide,
    pub version: SwapVersion,
    pub invoice: String,
    pub preimage_hash: String,
    pub lockup_address: String,
    pub timeout_block_height: u64,
    pub onchain_amount: u64,
    pub claim_address: Option<String>,
    pub miner_fee_invoice: Option<String>,
    pub miner_fee_invoice_preimage: Option<String>,
    pub minerfee_onchain_amount: Option<u64>,
    pub transaction_id: Option<String>,
    pub transaction_vout: Option<u32>,
    pub key_index: u32,
    pub redeem_script: Option<String>,
    pub their_public_key: Option<String>,
    pub lightning_currency: String,
    pub node: String,
    pub status: SwapUpdateEvent,
    pub miner_fee: Option<u64>,
}

/// One side of a chain swap. `sending` is the leg the server locks up on,
/// `receiving` the leg it expects the user lockup on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSwapLeg {
    pub symbol: String,
    pub lockup_address: String,
    pub claim_address: Option<String>,
    pub expected_amount: u64,
    pub timeout_block_height: u64,
    pub transaction_id: Option<String>,
    pub transaction_vout: Option<u32>,
    pub amount: Option<u64>,
    pub key_index: u32,
    pub redeem_script: Option<String>,
    pub their_public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSwap {
    pub id: String,
    pub version: SwapVersion,
    pub preimage_hash: String,
    pub preimage: Option<String>,
    pub sending: ChainSwapLeg,
    pub receiving: ChainSwapLeg,
    pub status: SwapUpdateEvent,
    pub claim_miner_fee: Option<u64>,
}

/// Channel a submarine swap requires to be opened before its invoice can be
/// paid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelCreation {
    pub swap_id: String,
    pub private: bool,
    pub inbound_liquidity: u64,
    pub funding_transaction_id: Option<String>,
}

/// Vbyte estimates for the transactions the nursery constructs. Used to
/// derive the server lockup feerate from a paid prepay invoice and to bound
/// claim/refund fees.
pub mod sizes {
    use super::SwapVersion;

    #[derive(Debug, Clone, Copy)]
    pub struct TransactionSizes {
        pub lockup: u64,
        pub claim: u64,
        pub refund: u64,
        pub reverse_lockup: u64,
        pub reverse_claim: u64,
    }

    pub const LEGACY: TransactionSizes = TransactionSizes {
        lockup: 153,
        claim: 170,
        refund: 161,
        reverse_lockup: 153,
        reverse_claim: 138,
    };

    pub const TAPROOT: TransactionSizes = TransactionSizes {
        lockup: 154,
        claim: 111,
        refund: 111,
        reverse_lockup: 154,
        reverse_claim: 111,
    };

    pub fn for_version(version: SwapVersion) -> &'static TransactionSizes {
        match version {
            SwapVersion::Legacy => &LEGACY,
            SwapVersion::Taproot => &TAPROOT,
        }
    }
}

/// Splits a trading pair like "L-BTC/BTC" into base and quote.
pub fn split_pair(pair: &str) -> anyhow::Result<(&str, &str)> {
    pair.split_once('/')
        .ok_or_else(|| anyhow::anyhow!("malformed pair: {pair}"))
}

/// The chain a swap's on-chain leg lives on. For submarine swaps the user
/// locks on the chain currency; for reverse swaps the server does.
pub fn chain_currency<'a>(
    base: &'a str,
    quote: &'a str,
    side: OrderSide,
    is_reverse: bool,
) -> &'a str {
    if is_reverse {
        match side {
            OrderSide::Buy => base,
            OrderSide::Sell => quote,
        }
    } else {
        match side {
            OrderSide::Buy => quote,
            OrderSide::Sell => base,
        }
    }
}

/// The Lightning side of the same pair; the mirror of [`chain_currency`].
pub fn lightning_currency<'a>(
    base: &'a str,
    quote: &'a str,
    side: OrderSide,
    is_reverse: bool,
) -> &'a str {
    chain_currency(base, quote, side, !is_reverse)
}

/// Millisatoshi to satoshi, rounding to nearest.
pub fn msat_to_sat(msat: u64) -> u64 {
    (msat + 500) / 1000
}

/// Feerate a paid prepay miner-fee invoice amounts to: the invoice paid for
/// the reverse lockup, so its satoshi value divided by the lockup size.
pub fn prepay_fee_per_vbyte(invoice_amount_msat: u64) -> f64 {
    let sats = msat_to_sat(invoice_amount_msat);
    (sats as f64 / sizes::LEGACY.reverse_lockup as f64).round()
}
