pub mod watcher;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::{ScriptBuf, Transaction, Txid};
use tokio::sync::mpsc;

use crate::currency::CurrencyType;

/// Stream items a chain backend delivers: relevant transactions (mempool and
/// confirmed) and new block heights.
#[derive(Debug, Clone)]
pub enum ChainSourceEvent {
    Transaction { tx: Transaction, confirmed: bool },
    Block { height: u64 },
}

/// Per-symbol chain backend. Fee rates are sat/vbyte.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn symbol(&self) -> &str;

    fn chain_type(&self) -> CurrencyType;

    async fn estimate_fee(&self, target_blocks: Option<u32>) -> Result<f64>;

    /// Raw transaction hex by id.
    async fn get_raw_transaction(&self, txid: &str) -> Result<String>;

    /// Broadcasts and returns the txid. `relaxed_fee_policy` lets refunds
    /// through mempool fee floors.
    async fn send_raw_transaction(&self, tx_hex: &str, relaxed_fee_policy: bool) -> Result<String>;

    /// Confirmation depth of a broadcast transaction, `None` while unknown
    /// to the backend.
    async fn transaction_confirmations(&self, txid: &str) -> Result<Option<u32>>;

    fn add_input_filter(&self, outpoint_txid: Txid);

    fn add_output_filter(&self, script: ScriptBuf);

    fn remove_input_filter(&self, outpoint_txid: &Txid);

    fn remove_output_filter(&self, script: &ScriptBuf);

    /// Transaction/block stream; a single consumer (the watcher) subscribes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChainSourceEvent>;
}

#[derive(Debug, Clone)]
pub struct WalletTransaction {
    pub transaction_hex: String,
    pub transaction_id: String,
    pub vout: u32,
    pub fee: u64,
}

/// Per-symbol wallet. Key storage and address derivation live behind this
/// seam.
#[async_trait]
pub trait Wallet: Send + Sync {
    fn symbol(&self) -> &str;

    async fn send_to_address(
        &self,
        address: &str,
        amount_sat: u64,
        fee_per_vbyte: f64,
        label: &str,
    ) -> Result<WalletTransaction>;

    async fn get_address(&self, label: &str) -> Result<String>;

    fn get_keys_by_index(&self, index: u32) -> Result<bitcoin::secp256k1::Keypair>;

    fn decode_address(&self, address: &str) -> Result<ScriptBuf>;
}

/// Outcome of the lockup acceptance checks run by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockupVerdict {
    Accept,
    /// Not acceptable while unconfirmed; fine once it confirms.
    RejectZeroConf(String),
    Reject(String),
}

/// External policy consulted for every observed user lockup.
#[async_trait]
pub trait TransactionHook: Send + Sync {
    async fn check(&self, swap_id: &str, tx: &Transaction, confirmed: bool) -> LockupVerdict;
}

/// Accepts everything. The default when no external hook is wired up.
pub struct AcceptingTransactionHook;

#[async_trait]
impl TransactionHook for AcceptingTransactionHook {
    async fn check(&self, _swap_id: &str, _tx: &Transaction, _confirmed: bool) -> LockupVerdict {
        LockupVerdict::Accept
    }
}

/// Rejects zero-conf acceptance of lockups that pay substantially more than
/// the expected amount; overpayments have been used to grief zero-conf
/// acceptance.
pub struct OverpaymentProtector {
    pub max_factor: u64,
}

impl Default for OverpaymentProtector {
    fn default() -> Self {
        Self { max_factor: 2 }
    }
}

impl OverpaymentProtector {
    pub fn check(&self, expected_amount: u64, actual_amount: u64, confirmed: bool) -> LockupVerdict {
        if confirmed {
            return LockupVerdict::Accept;
        }
        if actual_amount > expected_amount.saturating_mul(self.max_factor) {
            return LockupVerdict::RejectZeroConf(format!(
                "overpayment: expected {expected_amount}, got {actual_amount}"
            ));
        }
        LockupVerdict::Accept
    }
}
