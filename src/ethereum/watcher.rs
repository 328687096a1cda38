use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{ContractEvent, EthereumManager, wei_to_amount};
use crate::nursery::events::{ChainSwapEvent, ObservedLockup, ReverseSwapEvent, SubmarineEvent};
use crate::swap::SwapKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvmLockupRole {
    /// The user locks; we claim (submarine, chain receiving leg).
    UserLockup,
    /// We locked; the user claims (reverse, chain sending leg).
    ServerLockup,
}

#[derive(Debug, Clone)]
struct WatchedEvmSwap {
    swap_id: String,
    kind: SwapKind,
    role: EvmLockupRole,
    /// Unix timestamp of the HTLC timeout.
    timelock: u64,
}

/// Watches the EtherSwap/ERC20Swap contracts of one EVM chain. Events arrive
/// pre-decoded from the manager; the watcher routes them to the swap queues
/// and sweeps timelocks against block timestamps.
pub struct EthereumWatcher {
    manager: EthereumManager,
    swaps: Mutex<HashMap<[u8; 32], WatchedEvmSwap>>,
    submarine_tx: mpsc::Sender<SubmarineEvent>,
    reverse_tx: mpsc::Sender<ReverseSwapEvent>,
    chain_tx: mpsc::Sender<ChainSwapEvent>,
}

impl EthereumWatcher {
    pub fn new(
        manager: EthereumManager,
        submarine_tx: mpsc::Sender<SubmarineEvent>,
        reverse_tx: mpsc::Sender<ReverseSwapEvent>,
        chain_tx: mpsc::Sender<ChainSwapEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            swaps: Mutex::new(HashMap::new()),
            submarine_tx,
            reverse_tx,
            chain_tx,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.manager.symbol
    }

    pub fn watch(
        &self,
        preimage_hash: [u8; 32],
        swap_id: &str,
        kind: SwapKind,
        role: EvmLockupRole,
        timelock: u64,
    ) {
        self.swaps.lock().expect("watcher state poisoned").insert(
            preimage_hash,
            WatchedEvmSwap {
                swap_id: swap_id.to_string(),
                kind,
                role,
                timelock,
            },
        );
    }

    pub fn remove_swap(&self, swap_id: &str) {
        self.swaps
            .lock()
            .expect("watcher state poisoned")
            .retain(|_, w| w.swap_id != swap_id);
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let watcher = self.clone();
        let mut events = watcher.manager.handler.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                watcher.handle_event(event).await;
            }
            tracing::info!(symbol = %watcher.manager.symbol, "contract event stream closed");
        })
    }

    fn lookup(&self, preimage_hash: &[u8; 32]) -> Option<WatchedEvmSwap> {
        self.swaps
            .lock()
            .expect("watcher state poisoned")
            .get(preimage_hash)
            .cloned()
    }

    async fn handle_event(&self, event: ContractEvent) {
        match event {
            ContractEvent::Lockup {
                preimage_hash,
                transaction_hash,
                amount_wei,
                confirmed,
                ..
            } => {
                let Some(watched) = self.lookup(&preimage_hash) else {
                    return;
                };
                match watched.role {
                    EvmLockupRole::UserLockup => {
                        let lockup = ObservedLockup {
                            transaction_id: transaction_hash,
                            vout: 0,
                            value: wei_to_amount(amount_wei),
                        };
                        match watched.kind {
                            SwapKind::Submarine => {
                                let _ = self
                                    .submarine_tx
                                    .send(SubmarineEvent::Lockup {
                                        id: watched.swap_id,
                                        lockup,
                                        confirmed,
                                    })
                                    .await;
                            }
                            SwapKind::Chain => {
                                let _ = self
                                    .chain_tx
                                    .send(ChainSwapEvent::UserLockup {
                                        id: watched.swap_id,
                                        lockup,
                                        confirmed,
                                    })
                                    .await;
                            }
                            SwapKind::ReverseSubmarine => {}
                        }
                    }
                    EvmLockupRole::ServerLockup => {
                        if !confirmed {
                            return;
                        }
                        match watched.kind {
                            SwapKind::ReverseSubmarine => {
                                let _ = self
                                    .reverse_tx
                                    .send(ReverseSwapEvent::ServerLockupConfirmed {
                                        id: watched.swap_id,
                                    })
                                    .await;
                            }
                            SwapKind::Chain => {
                                let _ = self
                                    .chain_tx
                                    .send(ChainSwapEvent::ServerLockupConfirmed {
                                        id: watched.swap_id,
                                    })
                                    .await;
                            }
                            SwapKind::Submarine => {}
                        }
                    }
                }
            }
            ContractEvent::Claim {
                preimage_hash,
                preimage,
                transaction_hash,
                ..
            } => {
                let Some(watched) = self.lookup(&preimage_hash) else {
                    return;
                };
                tracing::info!(
                    symbol = %self.manager.symbol,
                    swap_id = %watched.swap_id,
                    transaction_hash = %transaction_hash,
                    "contract claim observed"
                );
                match watched.kind {
                    SwapKind::ReverseSubmarine => {
                        let _ = self
                            .reverse_tx
                            .send(ReverseSwapEvent::Claimed {
                                id: watched.swap_id,
                                preimage,
                            })
                            .await;
                    }
                    SwapKind::Chain => {
                        let _ = self
                            .chain_tx
                            .send(ChainSwapEvent::Claimed {
                                id: watched.swap_id,
                                preimage,
                            })
                            .await;
                    }
                    SwapKind::Submarine => {}
                }
            }
            ContractEvent::Refund { preimage_hash, .. } => {
                let Some(watched) = self.lookup(&preimage_hash) else {
                    return;
                };
                match watched.kind {
                    SwapKind::ReverseSubmarine => {
                        let _ = self
                            .reverse_tx
                            .send(ReverseSwapEvent::RefundConfirmed {
                                id: watched.swap_id,
                            })
                            .await;
                    }
                    SwapKind::Chain => {
                        let _ = self
                            .chain_tx
                            .send(ChainSwapEvent::RefundConfirmed {
                                id: watched.swap_id,
                            })
                            .await;
                    }
                    SwapKind::Submarine => {}
                }
            }
            ContractEvent::LockupFailedToSend {
                preimage_hash,
                reason,
            } => {
                let Some(watched) = self.lookup(&preimage_hash) else {
                    return;
                };
                match watched.kind {
                    SwapKind::ReverseSubmarine => {
                        let _ = self
                            .reverse_tx
                            .send(ReverseSwapEvent::LockupFailedToSend {
                                id: watched.swap_id,
                                reason,
                            })
                            .await;
                    }
                    SwapKind::Chain => {
                        let _ = self
                            .chain_tx
                            .send(ChainSwapEvent::LockupFailedToSend {
                                id: watched.swap_id,
                                reason,
                            })
                            .await;
                    }
                    SwapKind::Submarine => {}
                }
            }
            ContractEvent::Block { timestamp, .. } => {
                let expired: Vec<WatchedEvmSwap> = {
                    let mut swaps = self.swaps.lock().expect("watcher state poisoned");
                    let expired: Vec<WatchedEvmSwap> = swaps
                        .values()
                        .filter(|w| w.timelock <= timestamp)
                        .cloned()
                        .collect();
                    swaps.retain(|_, w| w.timelock > timestamp);
                    expired
                };

                for watched in expired {
                    tracing::info!(
                        symbol = %self.manager.symbol,
                        swap_id = %watched.swap_id,
                        "contract HTLC timed out"
                    );
                    match watched.kind {
                        SwapKind::Submarine => {
                            let _ = self
                                .submarine_tx
                                .send(SubmarineEvent::Expired {
                                    id: watched.swap_id,
                                })
                                .await;
                        }
                        SwapKind::ReverseSubmarine => {
                            let _ = self
                                .reverse_tx
                                .send(ReverseSwapEvent::Expired {
                                    id: watched.swap_id,
                                })
                                .await;
                        }
                        SwapKind::Chain => {
                            let _ = self
                                .chain_tx
                                .send(ChainSwapEvent::Expired {
                                    id: watched.swap_id,
                                })
                                .await;
                        }
                    }
                }
            }
        }
    }
}
