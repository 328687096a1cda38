use std::str::FromStr as _;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::{OutPoint, Transaction, Txid};

use crate::currency::Currency;
use crate::swap::store::{SqliteStore, claim_label};
use crate::swap::{SwapKind, SwapVersion, sizes};
use crate::utxo::{
    LockupOutput, SwapTree, aggregate_internal_key, claim_tx_p2wsh, claim_tx_taproot,
    fee_for_vsize,
};

/// Batches cooperative claims. Every claim is offered here first; when the
/// claimer takes it, the nursery emits `claim.pending` and stops.
#[async_trait]
pub trait DeferredClaimer: Send + Sync {
    async fn defer(&self, kind: SwapKind, swap_id: &str, preimage: [u8; 32]) -> bool;
}

/// Inputs to a UTXO claim, collected from the swap row.
#[derive(Debug, Clone)]
pub struct UtxoSpend<'a> {
    pub kind: SwapKind,
    pub swap_id: &'a str,
    pub version: SwapVersion,
    pub lockup_transaction_id: &'a str,
    pub lockup_vout: u32,
    pub key_index: u32,
    pub redeem_script: Option<&'a str>,
    pub their_public_key: Option<&'a str>,
    pub timeout_block_height: u64,
}

pub(crate) async fn lockup_output(
    currency: &Currency,
    spend: &UtxoSpend<'_>,
) -> Result<LockupOutput> {
    let chain_client = currency
        .chain_client
        .as_ref()
        .with_context(|| format!("{} has no chain client", currency.symbol))?;

    let raw = chain_client
        .get_raw_transaction(spend.lockup_transaction_id)
        .await
        .context("fetch lockup transaction")?;
    let tx: Transaction =
        bitcoin::consensus::encode::deserialize_hex(&raw).context("decode lockup transaction")?;
    let output = tx
        .output
        .get(spend.lockup_vout as usize)
        .with_context(|| format!("lockup vout {} out of range", spend.lockup_vout))?;

    Ok(LockupOutput {
        outpoint: OutPoint {
            txid: Txid::from_str(spend.lockup_transaction_id).context("parse lockup txid")?,
            vout: spend.lockup_vout,
        },
        value: output.value.to_sat(),
        script_pubkey: output.script_pubkey.clone(),
    })
}

/// Builds and broadcasts the claim spending the lockup to a fresh wallet
/// address. Returns the claim txid and the miner fee paid.
pub async fn claim_utxo(
    currency: &Currency,
    store: &Arc<Mutex<SqliteStore>>,
    spend: UtxoSpend<'_>,
    preimage: [u8; 32],
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

    let label = claim_label(spend.kind, spend.swap_id);
    let address = wallet.get_address(&label).await.context("claim address")?;
    let destination = wallet
        .decode_address(&address)
        .context("decode claim address")?;

    let fee_per_vbyte = chain_client
        .estimate_fee(None)
        .await
        .context("estimate claim fee")?;
    let fee = fee_for_vsize(fee_per_vbyte, sizes::for_version(spend.version).claim);

    let keys = wallet
        .get_keys_by_index(spend.key_index)
        .context("claim keys")?;
    let secp = Secp256k1::new();

    let tx = match spend.version {
        SwapVersion::Legacy => {
            let witness_script = bitcoin::ScriptBuf::from_hex(
                spend.redeem_script.context("legacy swap has no redeem script")?,
            )
            .context("decode redeem script")?;
            claim_tx_p2wsh(
                &secp,
                &witness_script,
                &lockup,
                &destination,
                &keys,
                preimage,
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
            claim_tx_taproot(
                &secp,
                &tree,
                internal_key,
                &lockup,
                &destination,
                &keys,
                preimage,
                fee,
            )?
        }
    };

    let tx_hex = bitcoin::consensus::encode::serialize_hex(&tx);
    let txid = chain_client
        .send_raw_transaction(&tx_hex, false)
        .await
        .context("broadcast claim")?;

    store
        .lock()
        .expect("store mutex poisoned")
        .add_transaction_label(&txid, &currency.symbol, &label)?;

    tracing::info!(swap_id = %spend.swap_id, claim_txid = %txid, fee, "broadcast claim");
    Ok((txid, fee))
}
