pub mod watcher;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Internal amounts are 8-decimal "satoshi-like" units; contracts take wei.
pub const ETHER_DECIMALS: u128 = 10_000_000_000;

pub fn amount_to_wei(amount_sat: u64) -> u128 {
    amount_sat as u128 * ETHER_DECIMALS
}

pub fn wei_to_amount(wei: u128) -> u64 {
    (wei / ETHER_DECIMALS) as u64
}

/// Handle of a submitted contract transaction.
#[derive(Debug, Clone)]
pub struct EvmTransaction {
    pub hash: String,
    pub gas_used: u64,
    pub effective_gas_price: u64,
}

impl EvmTransaction {
    pub fn fee(&self) -> u64 {
        self.gas_used * self.effective_gas_price
    }
}

/// Values recorded on-chain by an EtherSwap lockup, queried back from the
/// lockup transaction before claiming or refunding.
#[derive(Debug, Clone)]
pub struct EtherSwapValues {
    pub amount_wei: u128,
    pub claim_address: String,
    pub refund_address: String,
    pub timelock: u64,
}

#[derive(Debug, Clone)]
pub struct Erc20SwapValues {
    pub amount: u128,
    pub token_address: String,
    pub claim_address: String,
    pub refund_address: String,
    pub timelock: u64,
}

/// Contract family an event or call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractFamily {
    EtherSwap,
    Erc20Swap,
}

/// Events the EVM backend pushes at the watcher, already decoded from logs.
#[derive(Debug, Clone)]
pub enum ContractEvent {
    Lockup {
        family: ContractFamily,
        preimage_hash: [u8; 32],
        transaction_hash: String,
        amount_wei: u128,
        confirmed: bool,
    },
    Claim {
        family: ContractFamily,
        preimage_hash: [u8; 32],
        preimage: [u8; 32],
        transaction_hash: String,
    },
    Refund {
        family: ContractFamily,
        preimage_hash: [u8; 32],
        transaction_hash: String,
    },
    /// A locally submitted lockup failed at the JSON-RPC level (gas, nonce).
    LockupFailedToSend {
        preimage_hash: [u8; 32],
        reason: String,
    },
    /// New head, with its timestamp for timelock checks.
    Block { height: u64, timestamp: u64 },
}

#[async_trait]
pub trait ContractHandler: Send + Sync {
    async fn lockup_ether(
        &self,
        preimage_hash: &[u8; 32],
        amount_wei: u128,
        claim_address: &str,
        timelock: u64,
    ) -> Result<EvmTransaction>;

    async fn lockup_ether_prepay_minerfee(
        &self,
        preimage_hash: &[u8; 32],
        amount_wei: u128,
        prepay_wei: u128,
        claim_address: &str,
        timelock: u64,
    ) -> Result<EvmTransaction>;

    async fn lockup_token(
        &self,
        preimage_hash: &[u8; 32],
        amount: u128,
        claim_address: &str,
        timelock: u64,
    ) -> Result<EvmTransaction>;

    async fn lockup_token_prepay_minerfee(
        &self,
        preimage_hash: &[u8; 32],
        amount: u128,
        prepay_wei: u128,
        claim_address: &str,
        timelock: u64,
    ) -> Result<EvmTransaction>;

    async fn claim_ether(&self, preimage: &[u8; 32], values: &EtherSwapValues)
    -> Result<EvmTransaction>;

    async fn claim_token(&self, preimage: &[u8; 32], values: &Erc20SwapValues)
    -> Result<EvmTransaction>;

    async fn refund_ether(
        &self,
        preimage_hash: &[u8; 32],
        values: &EtherSwapValues,
    ) -> Result<EvmTransaction>;

    async fn refund_token(
        &self,
        preimage_hash: &[u8; 32],
        values: &Erc20SwapValues,
    ) -> Result<EvmTransaction>;

    async fn ether_swap_values(&self, lockup_transaction_hash: &str) -> Result<EtherSwapValues>;

    async fn erc20_swap_values(&self, lockup_transaction_hash: &str) -> Result<Erc20SwapValues>;

    /// Decoded contract event stream; a single consumer (the watcher)
    /// subscribes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ContractEvent>;
}

/// Couples a symbol with its contract handler. Built once at init; the
/// nursery looks managers up via a `symbol -> manager` map.
#[derive(Clone)]
pub struct EthereumManager {
    pub symbol: String,
    pub handler: Arc<dyn ContractHandler>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wei_conversion_is_ether_decimals() {
        assert_eq!(amount_to_wei(1), 10_000_000_000);
        assert_eq!(amount_to_wei(100_000_000), 1_000_000_000_000_000_000);
        assert_eq!(wei_to_amount(amount_to_wei(123_456)), 123_456);
    }

    #[test]
    fn evm_fee_is_gas_times_price() {
        let tx = EvmTransaction {
            hash: "0xabc".into(),
            gas_used: 21_000,
            effective_gas_price: 3,
        };
        assert_eq!(tx.fee(), 63_000);
    }
}
