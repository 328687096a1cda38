use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey};
use bitcoin::{OutPoint, ScriptBuf, Sequence, Txid};
use std::str::FromStr as _;

use swap_nursery::utxo::{
    LockupOutput, SwapScript, SwapTree, aggregate_internal_key, claim_tx_p2wsh, claim_tx_taproot,
    extract_preimage, pubkey_hash160, refund_tx_p2wsh, refund_tx_taproot, sha256_preimage,
};

fn keypair(byte: u8) -> Keypair {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[byte; 32]).expect("static key");
    Keypair::from_secret_key(&secp, &sk)
}

fn lockup(script_pubkey: ScriptBuf, value: u64) -> Result<LockupOutput> {
    Ok(LockupOutput {
        outpoint: OutPoint {
            txid: Txid::from_str(
                "0000000000000000000000000000000000000000000000000000000000000001",
            )
            .context("txid")?,
            vout: 0,
        },
        value,
        script_pubkey,
    })
}

#[test]
fn swap_script_claim_and_refund_build() -> Result<()> {
    let secp = Secp256k1::new();
    let claim_keys = keypair(1);
    let refund_keys = keypair(2);

    let preimage = [9u8; 32];
    let script = SwapScript {
        preimage_hash: sha256_preimage(&preimage),
        claim_pubkey_hash160: pubkey_hash160(&claim_keys.public_key().serialize()),
        refund_pubkey_hash160: pubkey_hash160(&refund_keys.public_key().serialize()),
        timeout_block_height: 1_000,
    };

    let witness_script = script.witness_script();
    let lockup_output = lockup(script.script_pubkey(), 5_000)?;
    let destination =
        ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array([0x42; 20]));

    let claim = claim_tx_p2wsh(
        &secp,
        &witness_script,
        &lockup_output,
        &destination,
        &claim_keys,
        preimage,
        500,
    )
    .context("build claim tx")?;
    assert_eq!(claim.lock_time, LockTime::ZERO);
    assert_eq!(claim.output[0].script_pubkey, destination);
    assert_eq!(claim.output[0].value.to_sat(), 4_500);
    assert_eq!(
        extract_preimage(&claim.input[0], &script.preimage_hash),
        Some(preimage)
    );

    let refund = refund_tx_p2wsh(
        &secp,
        &witness_script,
        script.timeout_block_height,
        &lockup_output,
        &destination,
        &refund_keys,
        500,
    )
    .context("build refund tx")?;
    assert_eq!(refund.lock_time, LockTime::from_height(1_000)?);
    assert_eq!(refund.input[0].sequence, Sequence::ENABLE_LOCKTIME_NO_RBF);
    // The refund path reveals no preimage.
    assert_eq!(extract_preimage(&refund.input[0], &script.preimage_hash), None);

    Ok(())
}

#[test]
fn fee_never_consumes_the_whole_output() {
    let secp = Secp256k1::new();
    let keys = keypair(3);
    let script = SwapScript {
        preimage_hash: [1u8; 32],
        claim_pubkey_hash160: [2u8; 20],
        refund_pubkey_hash160: [3u8; 20],
        timeout_block_height: 1_000,
    };
    let witness_script = script.witness_script();
    let lockup_output = lockup(script.script_pubkey(), 400).unwrap();
    let destination = ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array([0x42; 20]));

    let result = claim_tx_p2wsh(
        &secp,
        &witness_script,
        &lockup_output,
        &destination,
        &keys,
        [0u8; 32],
        500,
    );
    assert!(result.is_err());
}

#[test]
fn swap_tree_serialization_round_trips() -> Result<()> {
    let claim_keys = keypair(4);
    let refund_keys = keypair(5);
    let preimage = [7u8; 32];

    let tree = SwapTree::new(
        sha256_preimage(&preimage),
        claim_keys.x_only_public_key().0,
        refund_keys.x_only_public_key().0,
        812_345,
    );

    let serialized = tree.serialize()?;
    let deserialized = SwapTree::deserialize(&serialized)?;
    assert_eq!(tree, deserialized);

    // A second serialize of the deserialized tree is byte-identical.
    assert_eq!(serialized, deserialized.serialize()?);

    // Both leaves parse back into scripts.
    assert!(!deserialized.claim_script()?.is_empty());
    assert!(!deserialized.refund_script()?.is_empty());

    Ok(())
}

#[test]
fn taproot_refund_spends_via_refund_leaf() -> Result<()> {
    let secp = Secp256k1::new();
    let our_keys = keypair(6);
    let their_keys = keypair(8);
    let preimage = [6u8; 32];

    let internal_key =
        aggregate_internal_key(&our_keys.public_key(), &their_keys.public_key())?;
    let tree = SwapTree::new(
        sha256_preimage(&preimage),
        their_keys.x_only_public_key().0,
        our_keys.x_only_public_key().0,
        820_000,
    );

    let script_pubkey = tree.script_pubkey(&secp, internal_key)?;
    let lockup_output = lockup(script_pubkey, 50_000)?;
    let destination = ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array([0x42; 20]));

    let refund = refund_tx_taproot(
        &secp,
        &tree,
        internal_key,
        820_000,
        &lockup_output,
        &destination,
        &our_keys,
        600,
    )?;

    assert_eq!(refund.lock_time, LockTime::from_height(820_000)?);
    assert_eq!(refund.input[0].sequence, Sequence::ENABLE_LOCKTIME_NO_RBF);
    // Script-path spend: signature, leaf script, control block.
    assert_eq!(refund.input[0].witness.len(), 3);
    assert_eq!(
        refund.input[0].witness.iter().nth(1).unwrap(),
        tree.refund_script()?.as_bytes()
    );

    Ok(())
}

#[test]
fn taproot_claim_reveals_preimage() -> Result<()> {
    let secp = Secp256k1::new();
    let our_keys = keypair(9);
    let their_keys = keypair(10);
    let preimage = [11u8; 32];
    let preimage_hash = sha256_preimage(&preimage);

    let internal_key =
        aggregate_internal_key(&our_keys.public_key(), &their_keys.public_key())?;
    let tree = SwapTree::new(
        preimage_hash,
        our_keys.x_only_public_key().0,
        their_keys.x_only_public_key().0,
        830_000,
    );

    let script_pubkey = tree.script_pubkey(&secp, internal_key)?;
    let lockup_output = lockup(script_pubkey, 75_000)?;
    let destination = ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array([0x42; 20]));

    let claim = claim_tx_taproot(
        &secp,
        &tree,
        internal_key,
        &lockup_output,
        &destination,
        &our_keys,
        preimage,
        600,
    )?;

    assert_eq!(claim.input[0].witness.len(), 4);
    assert_eq!(extract_preimage(&claim.input[0], &preimage_hash), Some(preimage));

    Ok(())
}

#[test]
fn key_aggregation_is_order_sensitive() -> Result<()> {
    let a = keypair(12);
    let b = keypair(13);

    let ab = aggregate_internal_key(&a.public_key(), &b.public_key())?;
    let ab_again = aggregate_internal_key(&a.public_key(), &b.public_key())?;
    let ba = aggregate_internal_key(&b.public_key(), &a.public_key())?;

    assert_eq!(ab, ab_again);
    // The refund constructor has to use the creation-time order.
    assert_ne!(ab, ba);
    Ok(())
}
