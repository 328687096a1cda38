//! Coordinator core of an atomic swap service bridging UTXO chains, EVM
//! chains and Lightning.
//!
//! The nursery owns the per-swap state machine: watchers observe the chains
//! and Lightning nodes and feed events into three serial queues (one per
//! swap kind); the orchestrator consumes them, mutates the persisted swap
//! rows and drives lockups, claims and refunds through the wallet, contract
//! and Lightning collaborators.

pub mod chain;
pub mod config;
pub mod currency;
pub mod ethereum;
pub mod lightning;
pub mod logging;
pub mod nursery;
pub mod swap;
pub mod utxo;

pub use config::NurseryConfig;
pub use currency::{Currency, CurrencyMap, CurrencyType};
pub use nursery::SwapNursery;
pub use nursery::events::NurseryEvent;
pub use swap::{SwapKind, SwapUpdateEvent, SwapVersion};
