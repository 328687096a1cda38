use std::str::FromStr as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use tokio::sync::mpsc;

use super::claim::{UtxoSpend, lockup_output};
use super::events::{ChainSwapEvent, ReverseSwapEvent};
use crate::config::NurseryConfig;
use crate::currency::{Currency, CurrencyMap, CurrencyType};
use crate::ethereum::EthereumManager;
use crate::swap::store::{RefundTransaction, SqliteStore, refund_label};
use crate::swap::{SwapVersion, sizes};
use crate::utxo::{
    SwapTree, aggregate_internal_key, fee_for_vsize, refund_tx_p2wsh, refund_tx_taproot,
};

/// Builds and broadcasts the uni-lateral timeout refund of a server lockup.
/// Returns the refund txid and the miner fee paid.
pub async fn refund_utxo(
    currency: &Currency,
    store: &Arc<Mutex<SqliteStore>>,
    spend: UtxoSpend<'_>,
) -> Result<(String, u64)> {
    let chain_client = currency
        .chain_client
        .as_ref()
        .with_context(|| format!("{} has no chain client", currency.symbol))?;
    let wallet = currency
        .wallet
        .as_ref()
        .with_context(|| format!("{} has no wallet", currency.symbol))?;

    let lockup = lockup_output(currency, &spend).await?;

    let label = refund_label(spend.kind, spend.swap_id);
    let address = wallet.get_address(&label).await.context("refund address")?;
    let destination = wallet
        .decode_address(&address)
        .context("decode refund address")?;

    let fee_per_vbyte = chain_client
        .estimate_fee(None)
        .await
        .context("estimate refund fee")?;
    let fee = fee_for_vsize(fee_per_vbyte, sizes::for_version(spend.version).refund);

    let keys = wallet
        .get_keys_by_index(spend.key_index)
        .context("refund keys")?;
    let secp = Secp256k1::new();
    let timeout_height = u32::try_from(spend.timeout_block_height)
        .context("timeout block height out of range")?;

    let tx = match spend.version {
        SwapVersion::Legacy => {
            let witness_script = bitcoin::ScriptBuf::from_hex(
                spend.redeem_script.context("legacy swap has no redeem script")?,
            )
            .context("decode redeem script")?;
            refund_tx_p2wsh(
                &secp,
                &witness_script,
                timeout_height,
                &lockup,
                &destination,
                &keys,
                fee,
            )?
        }
        SwapVersion::Taproot => {
            let tree = SwapTree::deserialize(
                spend.redeem_script.context("taproot swap has no swap tree")?,
            )?;
            let their_key = PublicKey::from_str(
                spend
                    .their_public_key
                    .context("taproot swap has no counterparty key")?,
            )
            .context("parse counterparty key")?;
            let internal_key = aggregate_internal_key(&keys.public_key(), &their_key)?;
            refund_tx_taproot(
                &secp,
                &tree,
                internal_key,
                timeout_height,
                &lockup,
                &destination,
                &keys,
                fee,
            )?
        }
    };

    let tx_hex = bitcoin::consensus::encode::serialize_hex(&tx);
    let txid = chain_client
        .send_raw_transaction(&tx_hex, true)
        .await
        .context("broadcast refund")?;

    {
        let mut store = store.lock().expect("store mutex poisoned");
        store.add_refund_transaction(&RefundTransaction {
            swap_id: spend.swap_id.to_string(),
            transaction_id: txid.clone(),
            vin: Some(0),
            symbol: currency.symbol.clone(),
            confirmed: false,
        })?;
        store.add_transaction_label(&txid, &currency.symbol, &label)?;
    }

    tracing::info!(swap_id = %spend.swap_id, refund_txid = %txid, fee, "broadcast refund");
    Ok((txid, fee))
}

/// Refunds an EVM lockup through the swap contract. Returns the transaction
/// hash and the fee in gas terms.
pub async fn refund_evm(
    currency: &Currency,
    manager: &EthereumManager,
    store: &Arc<Mutex<SqliteStore>>,
    swap_id: &str,
    preimage_hash: &[u8; 32],
    lockup_transaction_hash: &str,
) -> Result<(String, u64)> {
    let handler = &manager.handler;
    let tx = match currency.currency_type {
        CurrencyType::Ether => {
            let values = handler
                .ether_swap_values(lockup_transaction_hash)
                .await
                .context("query ether swap values")?;
            handler
                .refund_ether(preimage_hash, &values)
                .await
                .context("refund ether")?
        }
        CurrencyType::Erc20 => {
            let values = handler
                .erc20_swap_values(lockup_transaction_hash)
                .await
                .context("query erc20 swap values")?;
            handler
                .refund_token(preimage_hash, &values)
                .await
                .context("refund token")?
        }
        other => anyhow::bail!("{other:?} is not an EVM currency"),
    };

    store
        .lock()
        .expect("store mutex poisoned")
        .add_refund_transaction(&RefundTransaction {
            swap_id: swap_id.to_string(),
            transaction_id: tx.hash.clone(),
            vin: None,
            symbol: currency.symbol.clone(),
            confirmed: false,
        })?;

    tracing::info!(swap_id = %swap_id, refund_tx = %tx.hash, "submitted contract refund");
    Ok((tx.hash.clone(), tx.fee()))
}

/// Polls broadcast refunds for confirmation and reports back into the
/// category queues so hold invoices can be cancelled.
pub struct RefundWatcher {
    store: Arc<Mutex<SqliteStore>>,
    currencies: CurrencyMap,
    poll_interval: Duration,
    confirmation_target: u32,
    reverse_tx: mpsc::Sender<ReverseSwapEvent>,
    chain_tx: mpsc::Sender<ChainSwapEvent>,
}

impl RefundWatcher {
    pub fn new(
        store: Arc<Mutex<SqliteStore>>,
        currencies: CurrencyMap,
        config: &NurseryConfig,
        reverse_tx: mpsc::Sender<ReverseSwapEvent>,
        chain_tx: mpsc::Sender<ChainSwapEvent>,
    ) -> Self {
        Self {
            store,
            currencies,
            poll_interval: Duration::from_secs(config.refund_poll_interval_secs),
            confirmation_target: config.refund_confirmation_target,
            reverse_tx,
            chain_tx,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.poll_interval);
            loop {
                timer.tick().await;
                if let Err(err) = self.poll_once().await {
                    tracing::error!(error = %err, "refund watcher poll failed");
                }
            }
        })
    }

    async fn poll_once(&self) -> Result<()> {
        let pending = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_unconfirmed_refunds()?;

        for refund in pending {
            let Some(currency) = self.currencies.get(&refund.symbol) else {
                tracing::warn!(symbol = %refund.symbol, "refund for unknown currency");
                continue;
            };
            let Some(chain_client) = currency.chain_client.as_ref() else {
                // EVM refunds confirm through the contract event stream.
                continue;
            };

            let confirmations = chain_client
                .transaction_confirmations(&refund.transaction_id)
                .await
                .with_context(|| format!("confirmations of {}", refund.transaction_id))?;
            let Some(confirmations) = confirmations else {
                continue;
            };
            if confirmations < self.confirmation_target {
                continue;
            }

            tracing::info!(
                swap_id = %refund.swap_id,
                refund_txid = %refund.transaction_id,
                "refund confirmed"
            );

            let is_reverse = self
                .store
                .lock()
                .expect("store mutex poisoned")
                .get_reverse_swap(&refund.swap_id)?
                .is_some();
            if is_reverse {
                let _ = self
                    .reverse_tx
                    .send(ReverseSwapEvent::RefundConfirmed {
                        id: refund.swap_id.clone(),
                    })
                    .await;
            } else {
                let _ = self
                    .chain_tx
                    .send(ChainSwapEvent::RefundConfirmed {
                        id: refund.swap_id.clone(),
                    })
                    .await;
            }
        }

        Ok(())
    }
}
