use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitcoin::{ScriptBuf, Transaction, Txid};
use tokio::sync::mpsc;

use super::{ChainClient, ChainSourceEvent, LockupVerdict, OverpaymentProtector, TransactionHook};
use crate::nursery::events::{ChainSwapEvent, ObservedLockup, ReverseSwapEvent, SubmarineEvent};
use crate::swap::SwapKind;
use crate::utxo::extract_preimage;

#[derive(Debug, Clone)]
enum OutputRole {
    UserLockup { expected_amount: u64 },
    ServerLockup,
}

#[derive(Debug, Clone)]
struct WatchedOutput {
    swap_id: String,
    kind: SwapKind,
    role: OutputRole,
}

#[derive(Debug, Clone)]
struct WatchedInput {
    swap_id: String,
    kind: SwapKind,
    preimage_hash: [u8; 32],
}

#[derive(Debug, Clone)]
struct WatchedTimeout {
    swap_id: String,
    kind: SwapKind,
    height: u64,
}

#[derive(Default)]
struct WatcherState {
    outputs: HashMap<ScriptBuf, WatchedOutput>,
    inputs: HashMap<Txid, WatchedInput>,
    timeouts: Vec<WatchedTimeout>,
}

/// Watches one UTXO chain: matches streamed transactions against per-swap
/// input/output filters and sweeps HTLC timeouts on every block.
pub struct UtxoChainWatcher {
    symbol: String,
    chain_client: Arc<dyn ChainClient>,
    hook: Arc<dyn TransactionHook>,
    overpayment: OverpaymentProtector,
    state: Mutex<WatcherState>,
    submarine_tx: mpsc::Sender<SubmarineEvent>,
    reverse_tx: mpsc::Sender<ReverseSwapEvent>,
    chain_tx: mpsc::Sender<ChainSwapEvent>,
}

impl UtxoChainWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_client: Arc<dyn ChainClient>,
        hook: Arc<dyn TransactionHook>,
        overpayment: OverpaymentProtector,
        submarine_tx: mpsc::Sender<SubmarineEvent>,
        reverse_tx: mpsc::Sender<ReverseSwapEvent>,
        chain_tx: mpsc::Sender<ChainSwapEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            symbol: chain_client.symbol().to_string(),
            chain_client,
            hook,
            overpayment,
            state: Mutex::new(WatcherState::default()),
            submarine_tx,
            reverse_tx,
            chain_tx,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Watches for the user lockup of a submarine or chain swap.
    pub fn watch_user_lockup(
        &self,
        swap_id: &str,
        kind: SwapKind,
        lockup_script: ScriptBuf,
        expected_amount: u64,
        timeout_block_height: u64,
    ) {
        {
            let mut state = self.state.lock().expect("watcher state poisoned");
            state.outputs.insert(
                lockup_script.clone(),
                WatchedOutput {
                    swap_id: swap_id.to_string(),
                    kind,
                    role: OutputRole::UserLockup { expected_amount },
                },
            );
        }
        self.chain_client.add_output_filter(lockup_script);
        self.watch_timeout(swap_id, kind, timeout_block_height);
    }

    /// Watches a broadcast server lockup: its own confirmation via the
    /// output filter and the counterparty claim via the input filter.
    pub fn watch_server_lockup(
        &self,
        swap_id: &str,
        kind: SwapKind,
        lockup_script: ScriptBuf,
        lockup_txid: Txid,
        preimage_hash: [u8; 32],
        timeout_block_height: u64,
    ) {
        {
            let mut state = self.state.lock().expect("watcher state poisoned");
            state.outputs.insert(
                lockup_script.clone(),
                WatchedOutput {
                    swap_id: swap_id.to_string(),
                    kind,
                    role: OutputRole::ServerLockup,
                },
            );
            state.inputs.insert(
                lockup_txid,
                WatchedInput {
                    swap_id: swap_id.to_string(),
                    kind,
                    preimage_hash,
                },
            );
        }
        self.chain_client.add_output_filter(lockup_script);
        self.chain_client.add_input_filter(lockup_txid);
        self.watch_timeout(swap_id, kind, timeout_block_height);
    }

    pub fn watch_timeout(&self, swap_id: &str, kind: SwapKind, height: u64) {
        let mut state = self.state.lock().expect("watcher state poisoned");
        if state
            .timeouts
            .iter()
            .any(|t| t.swap_id == swap_id && t.height == height)
        {
            return;
        }
        state.timeouts.push(WatchedTimeout {
            swap_id: swap_id.to_string(),
            kind,
            height,
        });
    }

    /// Drops all filters of a swap; called once it reaches a terminal
    /// status.
    pub fn remove_swap(&self, swap_id: &str) {
        let mut state = self.state.lock().expect("watcher state poisoned");
        let scripts: Vec<ScriptBuf> = state
            .outputs
            .iter()
            .filter(|(_, w)| w.swap_id == swap_id)
            .map(|(s, _)| s.clone())
            .collect();
        for script in scripts {
            state.outputs.remove(&script);
            self.chain_client.remove_output_filter(&script);
        }
        let txids: Vec<Txid> = state
            .inputs
            .iter()
            .filter(|(_, w)| w.swap_id == swap_id)
            .map(|(t, _)| *t)
            .collect();
        for txid in txids {
            state.inputs.remove(&txid);
            self.chain_client.remove_input_filter(&txid);
        }
        state.timeouts.retain(|t| t.swap_id != swap_id);
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let watcher = self.clone();
        let mut events = watcher.chain_client.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChainSourceEvent::Transaction { tx, confirmed } => {
                        watcher.handle_transaction(&tx, confirmed).await;
                    }
                    ChainSourceEvent::Block { height } => {
                        watcher.handle_block(height).await;
                    }
                }
            }
            tracing::info!(symbol = %watcher.symbol, "chain source stream closed");
        })
    }

    async fn handle_transaction(&self, tx: &Transaction, confirmed: bool) {
        // Collect matches under the lock, emit afterwards; handlers and hook
        // calls await.
        let (input_matches, output_matches) = {
            let state = self.state.lock().expect("watcher state poisoned");

            let input_matches: Vec<(WatchedInput, usize)> = tx
                .input
                .iter()
                .enumerate()
                .filter_map(|(vin, input)| {
                    state
                        .inputs
                        .get(&input.previous_output.txid)
                        .map(|w| (w.clone(), vin))
                })
                .collect();

            let output_matches: Vec<(WatchedOutput, u32, u64)> = tx
                .output
                .iter()
                .enumerate()
                .filter_map(|(vout, output)| {
                    state
                        .outputs
                        .get(&output.script_pubkey)
                        .map(|w| (w.clone(), vout as u32, output.value.to_sat()))
                })
                .collect();

            (input_matches, output_matches)
        };

        let txid = tx.compute_txid();

        for (watched, vin) in input_matches {
            let Some(preimage) = extract_preimage(&tx.input[vin], &watched.preimage_hash) else {
                tracing::warn!(
                    symbol = %self.symbol,
                    swap_id = %watched.swap_id,
                    spend_txid = %txid,
                    "lockup spend without matching preimage"
                );
                continue;
            };
            tracing::info!(
                symbol = %self.symbol,
                swap_id = %watched.swap_id,
                spend_txid = %txid,
                "counterparty claimed server lockup"
            );
            match watched.kind {
                SwapKind::ReverseSubmarine => {
                    let _ = self
                        .reverse_tx
                        .send(ReverseSwapEvent::Claimed {
                            id: watched.swap_id.clone(),
                            preimage,
                        })
                        .await;
                }
                SwapKind::Chain => {
                    let _ = self
                        .chain_tx
                        .send(ChainSwapEvent::Claimed {
                            id: watched.swap_id.clone(),
                            preimage,
                        })
                        .await;
                }
                SwapKind::Submarine => {}
            }
            let mut state = self.state.lock().expect("watcher state poisoned");
            state.inputs.remove(&tx.input[vin].previous_output.txid);
        }

        for (watched, vout, value) in output_matches {
            match watched.role {
                OutputRole::ServerLockup => {
                    if !confirmed {
                        continue;
                    }
                    match watched.kind {
                        SwapKind::ReverseSubmarine => {
                            let _ = self
                                .reverse_tx
                                .send(ReverseSwapEvent::ServerLockupConfirmed {
                                    id: watched.swap_id.clone(),
                                })
                                .await;
                        }
                        SwapKind::Chain => {
                            let _ = self
                                .chain_tx
                                .send(ChainSwapEvent::ServerLockupConfirmed {
                                    id: watched.swap_id.clone(),
                                })
                                .await;
                        }
                        SwapKind::Submarine => {}
                    }
                }
                OutputRole::UserLockup { expected_amount } => {
                    self.handle_user_lockup(
                        &watched,
                        expected_amount,
                        &txid,
                        vout,
                        value,
                        tx,
                        confirmed,
                    )
                    .await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_user_lockup(
        &self,
        watched: &WatchedOutput,
        expected_amount: u64,
        txid: &Txid,
        vout: u32,
        value: u64,
        tx: &Transaction,
        confirmed: bool,
    ) {
        if value < expected_amount {
            let reason = format!("insufficient amount: expected {expected_amount}, got {value}");
            tracing::warn!(
                symbol = %self.symbol,
                swap_id = %watched.swap_id,
                lockup_txid = %txid,
                %reason,
                "rejected user lockup"
            );
            self.send_lockup_failed(watched, reason).await;
            return;
        }

        let verdict = match self.hook.check(&watched.swap_id, tx, confirmed).await {
            LockupVerdict::Accept => self.overpayment.check(expected_amount, value, confirmed),
            other => other,
        };

        match verdict {
            LockupVerdict::Reject(reason) => {
                tracing::warn!(
                    symbol = %self.symbol,
                    swap_id = %watched.swap_id,
                    lockup_txid = %txid,
                    %reason,
                    "rejected user lockup"
                );
                self.send_lockup_failed(watched, reason).await;
            }
            LockupVerdict::RejectZeroConf(reason) if !confirmed => {
                tracing::warn!(
                    symbol = %self.symbol,
                    swap_id = %watched.swap_id,
                    lockup_txid = %txid,
                    %reason,
                    "rejected zero-conf lockup; waiting for confirmation"
                );
                // The filter stays; the confirmation re-enters the normal
                // path.
                self.send_zero_conf_rejected(watched, reason).await;
            }
            LockupVerdict::RejectZeroConf(_) | LockupVerdict::Accept => {
                let lockup = ObservedLockup {
                    transaction_id: txid.to_string(),
                    vout,
                    value,
                };
                match watched.kind {
                    SwapKind::Submarine => {
                        let _ = self
                            .submarine_tx
                            .send(SubmarineEvent::Lockup {
                                id: watched.swap_id.clone(),
                                lockup,
                                confirmed,
                            })
                            .await;
                    }
                    SwapKind::Chain => {
                        let _ = self
                            .chain_tx
                            .send(ChainSwapEvent::UserLockup {
                                id: watched.swap_id.clone(),
                                lockup,
                                confirmed,
                            })
                            .await;
                    }
                    SwapKind::ReverseSubmarine => {}
                }
            }
        }
    }

    async fn send_lockup_failed(&self, watched: &WatchedOutput, reason: String) {
        match watched.kind {
            SwapKind::Submarine => {
                let _ = self
                    .submarine_tx
                    .send(SubmarineEvent::LockupFailed {
                        id: watched.swap_id.clone(),
                        reason,
                    })
                    .await;
            }
            SwapKind::Chain => {
                let _ = self
                    .chain_tx
                    .send(ChainSwapEvent::LockupFailed {
                        id: watched.swap_id.clone(),
                        reason,
                    })
                    .await;
            }
            SwapKind::ReverseSubmarine => {}
        }
    }

    async fn send_zero_conf_rejected(&self, watched: &WatchedOutput, reason: String) {
        match watched.kind {
            SwapKind::Submarine => {
                let _ = self
                    .submarine_tx
                    .send(SubmarineEvent::ZeroConfRejected {
                        id: watched.swap_id.clone(),
                        reason,
                    })
                    .await;
            }
            SwapKind::Chain => {
                let _ = self
                    .chain_tx
                    .send(ChainSwapEvent::ZeroConfRejected {
                        id: watched.swap_id.clone(),
                        reason,
                    })
                    .await;
            }
            SwapKind::ReverseSubmarine => {}
        }
    }

    async fn handle_block(&self, height: u64) {
        let expired: Vec<WatchedTimeout> = {
            let mut state = self.state.lock().expect("watcher state poisoned");
            let (expired, live): (Vec<_>, Vec<_>) = state
                .timeouts
                .drain(..)
                .partition(|t| t.height <= height);
            state.timeouts = live;
            expired
        };

        for timeout in expired {
            tracing::info!(
                symbol = %self.symbol,
                swap_id = %timeout.swap_id,
                height,
                "onchain HTLC timed out"
            );
            match timeout.kind {
                SwapKind::Submarine => {
                    let _ = self
                        .submarine_tx
                        .send(SubmarineEvent::Expired {
                            id: timeout.swap_id.clone(),
                        })
                        .await;
                }
                SwapKind::ReverseSubmarine => {
                    let _ = self
                        .reverse_tx
                        .send(ReverseSwapEvent::Expired {
                            id: timeout.swap_id.clone(),
                        })
                        .await;
                }
                SwapKind::Chain => {
                    let _ = self
                        .chain_tx
                        .send(ChainSwapEvent::Expired {
                            id: timeout.swap_id.clone(),
                        })
                        .await;
                }
            }
        }
    }
}
