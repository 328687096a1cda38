use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{Hash as _, hash160, sha256};
use bitcoin::opcodes;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{All, Keypair, Message, PublicKey, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash, TaprootBuilder, TaprootSpendInfo};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use serde::{Deserialize, Serialize};

pub fn sha256_preimage(preimage: &[u8; 32]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}

pub fn pubkey_hash160(pubkey_bytes: &[u8]) -> [u8; 20] {
    hash160::Hash::hash(pubkey_bytes).to_byte_array()
}

/// Rounds the fee up to a whole satoshi.
pub fn fee_for_vsize(fee_per_vbyte: f64, vsize: u64) -> u64 {
    (fee_per_vbyte * vsize as f64).ceil() as u64
}

/// Legacy (pre-taproot) swap output: a P2WSH HTLC with a preimage claim
/// branch and a CLTV refund branch.
#[derive(Debug, Clone)]
pub struct SwapScript {
    pub preimage_hash: [u8; 32],
    pub claim_pubkey_hash160: [u8; 20],
    pub refund_pubkey_hash160: [u8; 20],
    pub timeout_block_height: u32,
}

impl SwapScript {
    pub fn witness_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(opcodes::all::OP_IF)
            .push_opcode(opcodes::all::OP_SIZE)
            .push_int(32)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(self.preimage_hash)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_DUP)
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(self.claim_pubkey_hash160)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .push_opcode(opcodes::all::OP_ELSE)
            .push_int(self.timeout_block_height as i64)
            .push_opcode(opcodes::all::OP_CLTV)
            .push_opcode(opcodes::all::OP_DROP)
            .push_opcode(opcodes::all::OP_DUP)
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(self.refund_pubkey_hash160)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .push_opcode(opcodes::all::OP_ENDIF)
            .into_script()
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2wsh(&self.witness_script().wscript_hash())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapTreeLeaf {
    pub version: u8,
    /// Hex-encoded leaf script.
    pub output: String,
}

impl SwapTreeLeaf {
    fn script(&self) -> Result<ScriptBuf> {
        Ok(ScriptBuf::from(
            hex::decode(&self.output).context("decode leaf script hex")?,
        ))
    }
}

/// Taproot swap output: the script tree with the claim and refund leaves.
/// This is what a taproot swap persists in place of a redeem script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapTree {
    pub claim_leaf: SwapTreeLeaf,
    pub refund_leaf: SwapTreeLeaf,
}

impl SwapTree {
    pub fn new(
        preimage_hash: [u8; 32],
        claim_key: XOnlyPublicKey,
        refund_key: XOnlyPublicKey,
        timeout_block_height: u32,
    ) -> Self {
        let claim_script = Builder::new()
            .push_opcode(opcodes::all::OP_SIZE)
            .push_int(32)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(preimage_hash)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_x_only_key(&claim_key)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .into_script();
        let refund_script = Builder::new()
            .push_x_only_key(&refund_key)
            .push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
            .push_int(timeout_block_height as i64)
            .push_opcode(opcodes::all::OP_CLTV)
            .into_script();

        Self {
            claim_leaf: SwapTreeLeaf {
                version: LeafVersion::TapScript.to_consensus(),
                output: hex::encode(claim_script.as_bytes()),
            },
            refund_leaf: SwapTreeLeaf {
                version: LeafVersion::TapScript.to_consensus(),
                output: hex::encode(refund_script.as_bytes()),
            },
        }
    }

    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize swap tree")
    }

    pub fn deserialize(data: &str) -> Result<Self> {
        serde_json::from_str(data).context("deserialize swap tree")
    }

    pub fn claim_script(&self) -> Result<ScriptBuf> {
        self.claim_leaf.script()
    }

    pub fn refund_script(&self) -> Result<ScriptBuf> {
        self.refund_leaf.script()
    }

    pub fn spend_info(
        &self,
        secp: &Secp256k1<All>,
        internal_key: XOnlyPublicKey,
    ) -> Result<TaprootSpendInfo> {
        TaprootBuilder::new()
            .add_leaf(1, self.claim_script()?)
            .context("add claim leaf")?
            .add_leaf(1, self.refund_script()?)
            .context("add refund leaf")?
            .finalize(secp, internal_key)
            .map_err(|_| anyhow::anyhow!("finalize taproot tree"))
    }

    pub fn script_pubkey(
        &self,
        secp: &Secp256k1<All>,
        internal_key: XOnlyPublicKey,
    ) -> Result<ScriptBuf> {
        let info = self.spend_info(secp, internal_key)?;
        Ok(ScriptBuf::new_p2tr_tweaked(info.output_key()))
    }
}

/// MuSig2 aggregate of our key and the counterparty key; the internal key of
/// a taproot swap output. Key order matters and must match the order used at
/// swap creation: our key first.
pub fn aggregate_internal_key(
    our_key: &PublicKey,
    their_key: &PublicKey,
) -> Result<XOnlyPublicKey> {
    let keys = [our_key, their_key]
        .iter()
        .map(|pk| musig2::secp256k1::PublicKey::from_slice(&pk.serialize()))
        .collect::<Result<Vec<_>, _>>()
        .context("convert public key for aggregation")?;
    let ctx = musig2::KeyAggContext::new(keys).context("aggregate MuSig2 keys")?;
    let aggregated: musig2::secp256k1::PublicKey = ctx.aggregated_pubkey();
    XOnlyPublicKey::from_slice(&aggregated.serialize()[1..33])
        .context("aggregated key is not a valid x-only key")
}

/// The lockup UTXO a claim or refund spends.
#[derive(Debug, Clone)]
pub struct LockupOutput {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: ScriptBuf,
}

fn single_output_tx(
    lockup: &LockupOutput,
    destination: &ScriptBuf,
    fee: u64,
    lock_time: LockTime,
    sequence: Sequence,
) -> Result<Transaction> {
    anyhow::ensure!(
        fee < lockup.value,
        "fee {fee} would consume the whole output of {}",
        lockup.value
    );
    Ok(Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: lockup.outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(lockup.value - fee),
            script_pubkey: destination.clone(),
        }],
    })
}

fn p2wsh_sign(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    witness_script: &ScriptBuf,
    value: u64,
    keys: &Keypair,
) -> Result<Vec<u8>> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(
            0,
            witness_script,
            Amount::from_sat(value),
            EcdsaSighashType::All,
        )
        .context("compute p2wsh sighash")?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let sig = secp.sign_ecdsa(&msg, &keys.secret_key());
    let mut sig_bytes = sig.serialize_der().to_vec();
    sig_bytes.push(EcdsaSighashType::All as u8);
    Ok(sig_bytes)
}

/// Claim spend of a legacy swap output: reveals the preimage on the IF
/// branch.
pub fn claim_tx_p2wsh(
    secp: &Secp256k1<All>,
    witness_script: &ScriptBuf,
    lockup: &LockupOutput,
    destination: &ScriptBuf,
    keys: &Keypair,
    preimage: [u8; 32],
    fee: u64,
) -> Result<Transaction> {
    let mut tx = single_output_tx(lockup, destination, fee, LockTime::ZERO, Sequence::MAX)?;
    let sig = p2wsh_sign(secp, &tx, witness_script, lockup.value, keys)?;
    let pubkey = keys.public_key().serialize();

    tx.input[0].witness = Witness::from_slice(&[
        sig,
        pubkey.to_vec(),
        preimage.to_vec(),
        vec![1u8],
        witness_script.to_bytes(),
    ]);
    Ok(tx)
}

/// Timeout refund of a legacy swap output: ELSE branch, locktime set to the
/// HTLC timeout.
pub fn refund_tx_p2wsh(
    secp: &Secp256k1<All>,
    witness_script: &ScriptBuf,
    timeout_block_height: u32,
    lockup: &LockupOutput,
    destination: &ScriptBuf,
    keys: &Keypair,
    fee: u64,
) -> Result<Transaction> {
    let lock_time =
        LockTime::from_height(timeout_block_height).context("timeout height is not a locktime")?;
    let mut tx = single_output_tx(
        lockup,
        destination,
        fee,
        lock_time,
        Sequence::ENABLE_LOCKTIME_NO_RBF,
    )?;
    let sig = p2wsh_sign(secp, &tx, witness_script, lockup.value, keys)?;
    let pubkey = keys.public_key().serialize();

    tx.input[0].witness = Witness::from_slice(&[
        sig,
        pubkey.to_vec(),
        Vec::new(),
        witness_script.to_bytes(),
    ]);
    Ok(tx)
}

/// Script-path claim of a taproot swap output via the claim leaf, revealing
/// the preimage. Cooperative key-path claims are the deferred claimer's
/// business, not ours.
pub fn claim_tx_taproot(
    secp: &Secp256k1<All>,
    tree: &SwapTree,
    internal_key: XOnlyPublicKey,
    lockup: &LockupOutput,
    destination: &ScriptBuf,
    keys: &Keypair,
    preimage: [u8; 32],
    fee: u64,
) -> Result<Transaction> {
    let mut tx = single_output_tx(lockup, destination, fee, LockTime::ZERO, Sequence::MAX)?;

    let claim_script = tree.claim_script()?;
    let leaf_hash = TapLeafHash::from_script(&claim_script, LeafVersion::TapScript);
    let prevout = TxOut {
        value: Amount::from_sat(lockup.value),
        script_pubkey: lockup.script_pubkey.clone(),
    };

    let mut cache = SighashCache::new(&tx);
    let sighash = cache
        .taproot_script_spend_signature_hash(
            0,
            &Prevouts::All(&[prevout]),
            leaf_hash,
            TapSighashType::Default,
        )
        .context("compute taproot sighash")?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let sig = secp.sign_schnorr_no_aux_rand(&msg, keys);

    let control_block = control_block_for(secp, tree, internal_key, &claim_script)?;
    tx.input[0].witness = Witness::from_slice(&[
        sig.as_ref().to_vec(),
        preimage.to_vec(),
        claim_script.to_bytes(),
        control_block.serialize(),
    ]);
    Ok(tx)
}

/// Uni-lateral timeout refund of a taproot swap output via the refund leaf.
/// `internal_key` is the MuSig2 aggregate the output was created with.
pub fn refund_tx_taproot(
    secp: &Secp256k1<All>,
    tree: &SwapTree,
    internal_key: XOnlyPublicKey,
    timeout_block_height: u32,
    lockup: &LockupOutput,
    destination: &ScriptBuf,
    keys: &Keypair,
    fee: u64,
) -> Result<Transaction> {
    let lock_time =
        LockTime::from_height(timeout_block_height).context("timeout height is not a locktime")?;
    let mut tx = single_output_tx(
        lockup,
        destination,
        fee,
        lock_time,
        Sequence::ENABLE_LOCKTIME_NO_RBF,
    )?;

    let refund_script = tree.refund_script()?;
    let leaf_hash = TapLeafHash::from_script(&refund_script, LeafVersion::TapScript);
    let prevout = TxOut {
        value: Amount::from_sat(lockup.value),
        script_pubkey: lockup.script_pubkey.clone(),
    };

    let mut cache = SighashCache::new(&tx);
    let sighash = cache
        .taproot_script_spend_signature_hash(
            0,
            &Prevouts::All(&[prevout]),
            leaf_hash,
            TapSighashType::Default,
        )
        .context("compute taproot sighash")?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let sig = secp.sign_schnorr_no_aux_rand(&msg, keys);

    let control_block = control_block_for(secp, tree, internal_key, &refund_script)?;
    tx.input[0].witness = Witness::from_slice(&[
        sig.as_ref().to_vec(),
        refund_script.to_bytes(),
        control_block.serialize(),
    ]);
    Ok(tx)
}

fn control_block_for(
    secp: &Secp256k1<All>,
    tree: &SwapTree,
    internal_key: XOnlyPublicKey,
    script: &ScriptBuf,
) -> Result<ControlBlock> {
    tree.spend_info(secp, internal_key)?
        .control_block(&(script.clone(), LeafVersion::TapScript))
        .context("refund leaf is not part of the tree")
}

/// Pulls the revealed preimage out of a spending input. Works across script
/// variants by scanning the witness (and legacy scriptSig pushes) for the
/// 32-byte element hashing to `preimage_hash`.
pub fn extract_preimage(input: &TxIn, preimage_hash: &[u8; 32]) -> Option<[u8; 32]> {
    for item in input.witness.iter() {
        if let Ok(candidate) = <[u8; 32]>::try_from(item)
            && sha256_preimage(&candidate) == *preimage_hash
        {
            return Some(candidate);
        }
    }
    for instruction in input.script_sig.instructions().flatten() {
        if let bitcoin::script::Instruction::PushBytes(bytes) = instruction
            && let Ok(candidate) = <[u8; 32]>::try_from(bytes.as_bytes())
            && sha256_preimage(&candidate) == *preimage_hash
        {
            return Some(candidate);
        }
    }
    None
}
