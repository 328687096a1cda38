use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, params};

use super::{
    ChainSwap, ChainSwapLeg, ChannelCreation, OrderSide, ReverseSwap, Submarine, SwapKind,
    SwapUpdateEvent, SwapVersion,
};

/// Labels persisted for every transaction the nursery broadcasts.
pub fn lockup_label(kind: SwapKind, swap_id: &str) -> String {
    format!("Lockup for {} {swap_id}", kind_label(kind))
}

pub fn claim_label(kind: SwapKind, swap_id: &str) -> String {
    format!("Claim for {} {swap_id}", kind_label(kind))
}

pub fn refund_label(kind: SwapKind, swap_id: &str) -> String {
    format!("Refund for {} {swap_id}", kind_label(kind))
}

fn kind_label(kind: SwapKind) -> &'static str {
    match kind {
        SwapKind::Submarine => "Swap",
        SwapKind::ReverseSubmarine => "Reverse Swap",
        SwapKind::Chain => "Chain Swap",
    }
}

#[derive(Debug, Clone)]
pub struct RefundTransaction {
    pub swap_id: String,
    pub transaction_id: String,
    pub vin: Option<u32>,
    pub symbol: String,
    pub confirmed: bool,
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create sqlite store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        migrate(&conn).context("migrate sqlite schema")?;
        Ok(Self {
            conn,
            path: PathBuf::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --- submarine swaps ---

    pub fn insert_swap(&mut self, swap: &Submarine) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO swaps (
  id, pair, order_side, version, invoice, preimage_hash, lockup_address,
  timeout_block_height, expected_amount, onchain_amount,
  lockup_transaction_id, lockup_transaction_vout, key_index, redeem_script,
  their_public_key, rate, status, miner_fee
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
"#,
                params![
                    &swap.id,
                    &swap.pair,
                    side_to_str(swap.order_side),
                    version_to_str(swap.version),
                    swap.invoice.as_deref(),
                    &swap.preimage_hash,
                    &swap.lockup_address,
                    swap.timeout_block_height as i64,
                    swap.expected_amount as i64,
                    swap.onchain_amount as i64,
                    swap.lockup_transaction_id.as_deref(),
                    swap.lockup_transaction_vout,
                    swap.key_index,
                    swap.redeem_script.as_deref(),
                    swap.their_public_key.as_deref(),
                    swap.rate,
                    swap.status.as_str(),
                    swap.miner_fee.map(|f| f as i64),
                ],
            )
            .with_context(|| format!("insert swap {}", swap.id))?;
        Ok(())
    }

    pub fn get_swap(&self, id: &str) -> Result<Option<Submarine>> {
        self.conn
            .query_row(
                &format!("{SWAP_SELECT} WHERE id = ?1"),
                params![id],
                row_to_swap,
            )
            .optional()
            .with_context(|| format!("get swap {id}"))
    }

    /// Lookup used by the cyclic self-payment guard: a submarine swap paying
    /// the given invoice with the given preimage hash.
    pub fn get_swap_by_invoice(
        &self,
        invoice: &str,
        preimage_hash: &str,
    ) -> Result<Option<Submarine>> {
        self.conn
            .query_row(
                &format!("{SWAP_SELECT} WHERE invoice = ?1 AND preimage_hash = ?2"),
                params![invoice, preimage_hash],
                row_to_swap,
            )
            .optional()
            .context("get swap by invoice")
    }

    pub fn get_swaps_with_status(&self, statuses: &[SwapUpdateEvent]) -> Result<Vec<Submarine>> {
        let mut out = Vec::new();
        for status in statuses {
            let mut stmt = self
                .conn
                .prepare(&format!("{SWAP_SELECT} WHERE status = ?1"))
                .context("prepare swaps by status")?;
            let rows = stmt
                .query_map(params![status.as_str()], row_to_swap)
                .context("query swaps by status")?;
            for row in rows {
                out.push(row.context("read swap row")?);
            }
        }
        Ok(out)
    }

    pub fn set_swap_status(&mut self, id: &str, status: SwapUpdateEvent) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE swaps SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .with_context(|| format!("set swap status {id}"))?;
        anyhow::ensure!(rows == 1, "swap not found: {id}");
        Ok(())
    }

    pub fn set_swap_rate(&mut self, id: &str, rate: f64) -> Result<()> {
        let rows = self
            .conn
            .execute("UPDATE swaps SET rate = ?2 WHERE id = ?1", params![id, rate])
            .with_context(|| format!("set swap rate {id}"))?;
        anyhow::ensure!(rows == 1, "swap not found: {id}");
        Ok(())
    }

    pub fn set_swap_miner_fee(&mut self, id: &str, miner_fee: u64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE swaps SET miner_fee = ?2 WHERE id = ?1",
                params![id, miner_fee as i64],
            )
            .with_context(|| format!("set swap miner fee {id}"))?;
        anyhow::ensure!(rows == 1, "swap not found: {id}");
        Ok(())
    }

    pub fn set_swap_lockup_transaction(
        &mut self,
        id: &str,
        transaction_id: &str,
        vout: u32,
        onchain_amount: u64,
    ) -> Result<()> {
        let rows = self
            .conn
            .execute(
                r#"
UPDATE swaps
SET lockup_transaction_id = ?2,
    lockup_transaction_vout = ?3,
    onchain_amount = ?4
WHERE id = ?1
"#,
                params![id, transaction_id, vout, onchain_amount as i64],
            )
            .with_context(|| format!("set swap lockup transaction {id}"))?;
        anyhow::ensure!(rows == 1, "swap not found: {id}");
        Ok(())
    }

    // --- reverse swaps ---

    pub fn insert_reverse_swap(&mut self, swap: &ReverseSwap) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO reverse_swaps (
  id, pair, order_side, version, invoice, preimage_hash, lockup_address,
  timeout_block_height, onchain_amount, claim_address, miner_fee_invoice,
  miner_fee_invoice_preimage, minerfee_onchain_amount, transaction_id,
  transaction_vout, key_index, redeem_script, their_public_key,
  lightning_currency, node, status, miner_fee
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
          ?16, ?17, ?18, ?19, ?20, ?21, ?22)
"#,
                params![
                    &swap.id,
                    &swap.pair,
                    side_to_str(swap.order_side),
                    version_to_str(swap.version),
                    &swap.invoice,
                    &swap.preimage_hash,
                    &swap.lockup_address,
                    swap.timeout_block_height as i64,
                    swap.onchain_amount as i64,
                    swap.claim_address.as_deref(),
                    swap.miner_fee_invoice.as_deref(),
                    swap.miner_fee_invoice_preimage.as_deref(),
                    swap.minerfee_onchain_amount.map(|v| v as i64),
                    swap.transaction_id.as_deref(),
                    swap.transaction_vout,
                    swap.key_index,
                    swap.redeem_script.as_deref(),
                    swap.their_public_key.as_deref(),
                    &swap.lightning_currency,
                    &swap.node,
                    swap.status.as_str(),
                    swap.miner_fee.map(|f| f as i64),
                ],
            )
            .with_context(|| format!("insert reverse swap {}", swap.id))?;
        Ok(())
    }

    pub fn get_reverse_swap(&self, id: &str) -> Result<Option<ReverseSwap>> {
        self.conn
            .query_row(
                &format!("{REVERSE_SELECT} WHERE id = ?1"),
                params![id],
                row_to_reverse_swap,
            )
            .optional()
            .with_context(|| format!("get reverse swap {id}"))
    }

    pub fn get_reverse_swap_by_preimage_hash(
        &self,
        preimage_hash: &str,
    ) -> Result<Option<ReverseSwap>> {
        self.conn
            .query_row(
                &format!("{REVERSE_SELECT} WHERE preimage_hash = ?1"),
                params![preimage_hash],
                row_to_reverse_swap,
            )
            .optional()
            .context("get reverse swap by preimage hash")
    }

    pub fn get_reverse_swaps_with_status(
        &self,
        statuses: &[SwapUpdateEvent],
    ) -> Result<Vec<ReverseSwap>> {
        let mut out = Vec::new();
        for status in statuses {
            let mut stmt = self
                .conn
                .prepare(&format!("{REVERSE_SELECT} WHERE status = ?1"))
                .context("prepare reverse swaps by status")?;
            let rows = stmt
                .query_map(params![status.as_str()], row_to_reverse_swap)
                .context("query reverse swaps by status")?;
            for row in rows {
                out.push(row.context("read reverse swap row")?);
            }
        }
        Ok(out)
    }

    pub fn set_reverse_swap_status(&mut self, id: &str, status: SwapUpdateEvent) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE reverse_swaps SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .with_context(|| format!("set reverse swap status {id}"))?;
        anyhow::ensure!(rows == 1, "reverse swap not found: {id}");
        Ok(())
    }

    /// Records the server lockup broadcast. Once `transaction_id` is set,
    /// the caller refuses any further lockup attempt.
    pub fn set_reverse_swap_lockup_transaction(
        &mut self,
        id: &str,
        transaction_id: &str,
        vout: u32,
        miner_fee: u64,
    ) -> Result<()> {
        let rows = self
            .conn
            .execute(
                r#"
UPDATE reverse_swaps
SET transaction_id = ?2,
    transaction_vout = ?3,
    miner_fee = ?4,
    status = ?5
WHERE id = ?1
"#,
                params![
                    id,
                    transaction_id,
                    vout,
                    miner_fee as i64,
                    SwapUpdateEvent::TransactionMempool.as_str()
                ],
            )
            .with_context(|| format!("set reverse swap lockup {id}"))?;
        anyhow::ensure!(rows == 1, "reverse swap not found: {id}");
        Ok(())
    }

    pub fn set_invoice_settled(&mut self, id: &str, preimage: &str) -> Result<()> {
        let rows = self
            .conn
            .execute(
                r#"
UPDATE reverse_swaps
SET preimage = ?2,
    status = ?3
WHERE id = ?1
"#,
                params![id, preimage, SwapUpdateEvent::InvoiceSettled.as_str()],
            )
            .with_context(|| format!("set invoice settled {id}"))?;
        anyhow::ensure!(rows == 1, "reverse swap not found: {id}");
        Ok(())
    }

    // --- chain swaps ---

    pub fn insert_chain_swap(&mut self, swap: &ChainSwap) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO chain_swaps (id, version, preimage_hash, preimage, status, claim_miner_fee)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
                params![
                    &swap.id,
                    version_to_str(swap.version),
                    &swap.preimage_hash,
                    swap.preimage.as_deref(),
                    swap.status.as_str(),
                    swap.claim_miner_fee.map(|f| f as i64),
                ],
            )
            .with_context(|| format!("insert chain swap {}", swap.id))?;
        self.insert_chain_swap_leg(&swap.id, &swap.sending, true)?;
        self.insert_chain_swap_leg(&swap.id, &swap.receiving, false)?;
        Ok(())
    }

    fn insert_chain_swap_leg(
        &mut self,
        swap_id: &str,
        leg: &ChainSwapLeg,
        is_sending: bool,
    ) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO chain_swap_legs (
  swap_id, is_sending, symbol, lockup_address, claim_address,
  expected_amount, timeout_block_height, transaction_id, transaction_vout,
  amount, key_index, redeem_script, their_public_key
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
"#,
                params![
                    swap_id,
                    is_sending,
                    &leg.symbol,
                    &leg.lockup_address,
                    leg.claim_address.as_deref(),
                    leg.expected_amount as i64,
                    leg.timeout_block_height as i64,
                    leg.transaction_id.as_deref(),
                    leg.transaction_vout,
                    leg.amount.map(|v| v as i64),
                    leg.key_index,
                    leg.redeem_script.as_deref(),
                    leg.their_public_key.as_deref(),
                ],
            )
            .with_context(|| format!("insert chain swap leg {swap_id}"))?;
        Ok(())
    }

    pub fn get_chain_swap(&self, id: &str) -> Result<Option<ChainSwap>> {
        let base = self
            .conn
            .query_row(
                "SELECT id, version, preimage_hash, preimage, status, claim_miner_fee
                 FROM chain_swaps WHERE id = ?1",
                params![id],
                |row| {
                    let version: String = row.get(1)?;
                    let status: String = row.get(4)?;
                    let claim_miner_fee: Option<i64> = row.get(5)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        version,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        status,
                        claim_miner_fee,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("get chain swap {id}"))?;

        let Some((id, version, preimage_hash, preimage, status, claim_miner_fee)) = base else {
            return Ok(None);
        };

        let sending = self
            .get_chain_swap_leg(&id, true)?
            .context("chain swap has no sending leg")?;
        let receiving = self
            .get_chain_swap_leg(&id, false)?
            .context("chain swap has no receiving leg")?;

        Ok(Some(ChainSwap {
            id,
            version: version_from_str(&version)?,
            preimage_hash,
            preimage,
            sending,
            receiving,
            status: status_from_str(&status)?,
            claim_miner_fee: claim_miner_fee.map(|f| f as u64),
        }))
    }

    fn get_chain_swap_leg(&self, swap_id: &str, is_sending: bool) -> Result<Option<ChainSwapLeg>> {
        self.conn
            .query_row(
                r#"
SELECT symbol, lockup_address, claim_address, expected_amount,
       timeout_block_height, transaction_id, transaction_vout, amount,
       key_index, redeem_script, their_public_key
FROM chain_swap_legs
WHERE swap_id = ?1 AND is_sending = ?2
"#,
                params![swap_id, is_sending],
                |row| {
                    let expected_amount: i64 = row.get(3)?;
                    let timeout_block_height: i64 = row.get(4)?;
                    let amount: Option<i64> = row.get(7)?;
                    Ok(ChainSwapLeg {
                        symbol: row.get(0)?,
                        lockup_address: row.get(1)?,
                        claim_address: row.get(2)?,
                        expected_amount: expected_amount as u64,
                        timeout_block_height: timeout_block_height as u64,
                        transaction_id: row.get(5)?,
                        transaction_vout: row.get(6)?,
                        amount: amount.map(|v| v as u64),
                        key_index: row.get(8)?,
                        redeem_script: row.get(9)?,
                        their_public_key: row.get(10)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("get chain swap leg {swap_id}"))
    }

    pub fn set_chain_swap_status(&mut self, id: &str, status: SwapUpdateEvent) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE chain_swaps SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .with_context(|| format!("set chain swap status {id}"))?;
        anyhow::ensure!(rows == 1, "chain swap not found: {id}");
        Ok(())
    }

    pub fn set_chain_swap_preimage(&mut self, id: &str, preimage: &str) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE chain_swaps SET preimage = ?2 WHERE id = ?1",
                params![id, preimage],
            )
            .with_context(|| format!("set chain swap preimage {id}"))?;
        anyhow::ensure!(rows == 1, "chain swap not found: {id}");
        Ok(())
    }

    pub fn set_claim_miner_fee(&mut self, id: &str, fee: u64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE chain_swaps SET claim_miner_fee = ?2 WHERE id = ?1",
                params![id, fee as i64],
            )
            .with_context(|| format!("set chain swap claim miner fee {id}"))?;
        anyhow::ensure!(rows == 1, "chain swap not found: {id}");
        Ok(())
    }

    pub fn set_chain_swap_leg_transaction(
        &mut self,
        swap_id: &str,
        is_sending: bool,
        transaction_id: &str,
        vout: u32,
        amount: u64,
    ) -> Result<()> {
        let rows = self
            .conn
            .execute(
                r#"
UPDATE chain_swap_legs
SET transaction_id = ?3,
    transaction_vout = ?4,
    amount = ?5
WHERE swap_id = ?1 AND is_sending = ?2
"#,
                params![swap_id, is_sending, transaction_id, vout, amount as i64],
            )
            .with_context(|| format!("set chain swap leg transaction {swap_id}"))?;
        anyhow::ensure!(rows == 1, "chain swap leg not found: {swap_id}");
        Ok(())
    }

    // --- refund transactions ---

    pub fn add_refund_transaction(&mut self, refund: &RefundTransaction) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO refund_transactions (swap_id, transaction_id, vin, symbol, confirmed)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
                params![
                    &refund.swap_id,
                    &refund.transaction_id,
                    refund.vin,
                    &refund.symbol,
                    refund.confirmed,
                ],
            )
            .with_context(|| format!("add refund transaction {}", refund.swap_id))?;
        Ok(())
    }

    pub fn get_unconfirmed_refunds(&self) -> Result<Vec<RefundTransaction>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT swap_id, transaction_id, vin, symbol, confirmed
                 FROM refund_transactions WHERE confirmed = 0",
            )
            .context("prepare unconfirmed refunds")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RefundTransaction {
                    swap_id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    vin: row.get(2)?,
                    symbol: row.get(3)?,
                    confirmed: row.get(4)?,
                })
            })
            .context("query unconfirmed refunds")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read refund row")?);
        }
        Ok(out)
    }

    pub fn set_refund_confirmed(&mut self, swap_id: &str) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE refund_transactions SET confirmed = 1 WHERE swap_id = ?1",
                params![swap_id],
            )
            .with_context(|| format!("set refund confirmed {swap_id}"))?;
        anyhow::ensure!(rows == 1, "refund transaction not found: {swap_id}");
        Ok(())
    }

    // --- channel creations ---

    pub fn insert_channel_creation(&mut self, creation: &ChannelCreation) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO channel_creations (swap_id, private, inbound_liquidity, funding_transaction_id)
VALUES (?1, ?2, ?3, ?4)
"#,
                params![
                    &creation.swap_id,
                    creation.private,
                    creation.inbound_liquidity as i64,
                    creation.funding_transaction_id.as_deref(),
                ],
            )
            .with_context(|| format!("insert channel creation {}", creation.swap_id))?;
        Ok(())
    }

    pub fn get_channel_creation(&self, swap_id: &str) -> Result<Option<ChannelCreation>> {
        self.conn
            .query_row(
                "SELECT swap_id, private, inbound_liquidity, funding_transaction_id
                 FROM channel_creations WHERE swap_id = ?1",
                params![swap_id],
                |row| {
                    let inbound: i64 = row.get(2)?;
                    Ok(ChannelCreation {
                        swap_id: row.get(0)?,
                        private: row.get(1)?,
                        inbound_liquidity: inbound as u64,
                        funding_transaction_id: row.get(3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("get channel creation {swap_id}"))
    }

    // --- transaction labels ---

    pub fn add_transaction_label(
        &mut self,
        transaction_id: &str,
        symbol: &str,
        label: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT OR REPLACE INTO transaction_labels (transaction_id, symbol, label)
VALUES (?1, ?2, ?3)
"#,
                params![transaction_id, symbol, label],
            )
            .with_context(|| format!("add transaction label {transaction_id}"))?;
        Ok(())
    }

    pub fn get_transaction_label(&self, transaction_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT label FROM transaction_labels WHERE transaction_id = ?1",
                params![transaction_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("get transaction label {transaction_id}"))
    }
}

const SWAP_SELECT: &str = r#"
SELECT id, pair, order_side, version, invoice, preimage_hash, lockup_address,
       timeout_block_height, expected_amount, onchain_amount,
       lockup_transaction_id, lockup_transaction_vout, key_index,
       redeem_script, their_public_key, rate, status, miner_fee
FROM swaps
"#;

const REVERSE_SELECT: &str = r#"
SELECT id, pair, order_side, version, invoice, preimage_hash, lockup_address,
       timeout_block_height, onchain_amount, claim_address, miner_fee_invoice,
       miner_fee_invoice_preimage, minerfee_onchain_amount, transaction_id,
       transaction_vout, key_index, redeem_script, their_public_key,
       lightning_currency, node, status, miner_fee
FROM reverse_swaps
"#;

fn row_to_swap(row: &rusqlite::Row<'_>) -> rusqlite::Result<Submarine> {
    let order_side: String = row.get(2)?;
    let version: String = row.get(3)?;
    let timeout_block_height: i64 = row.get(7)?;
    let expected_amount: i64 = row.get(8)?;
    let onchain_amount: i64 = row.get(9)?;
    let status: String = row.get(16)?;
    let miner_fee: Option<i64> = row.get(17)?;

    Ok(Submarine {
        id: row.get(0)?,
        pair: row.get(1)?,
        order_side: side_from_str(&order_side).map_err(|e| conversion_error(2, e))?,
        version: version_from_str(&version).map_err(|e| conversion_error(3, e))?,
        invoice: row.get(4)?,
        preimage_hash: row.get(5)?,
        lockup_address: row.get(6)?,
        timeout_block_height: timeout_block_height as u64,
        expected_amount: expected_amount as u64,
        onchain_amount: onchain_amount as u64,
        lockup_transaction_id: row.get(10)?,
        lockup_transaction_vout: row.get(11)?,
        key_index: row.get(12)?,
        redeem_script: row.get(13)?,
        their_public_key: row.get(14)?,
        rate: row.get(15)?,
        status: status_from_str(&status).map_err(|e| conversion_error(16, e))?,
        miner_fee: miner_fee.map(|f| f as u64),
    })
}

fn row_to_reverse_swap(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReverseSwap> {
    let order_side: String = row.get(2)?;
    let version: String = row.get(3)?;
    let timeout_block_height: i64 = row.get(7)?;
    let onchain_amount: i64 = row.get(8)?;
    let minerfee_onchain_amount: Option<i64> = row.get(12)?;
    let status: String = row.get(20)?;
    let miner_fee: Option<i64> = row.get(21)?;

    Ok(ReverseSwap {
        id: row.get(0)?,
        pair: row.get(1)?,
        order_side: side_from_str(&order_side).map_err(|e| conversion_error(2, e))?,
        version: version_from_str(&version).map_err(|e| conversion_error(3, e))?,
        invoice: row.get(4)?,
        preimage_hash: row.get(5)?,
        lockup_address: row.get(6)?,
        timeout_block_height: timeout_block_height as u64,
        onchain_amount: onchain_amount as u64,
        claim_address: row.get(9)?,
        miner_fee_invoice: row.get(10)?,
        miner_fee_invoice_preimage: row.get(11)?,
        minerfee_onchain_amount: minerfee_onchain_amount.map(|v| v as u64),
        transaction_id: row.get(13)?,
        transaction_vout: row.get(14)?,
        key_index: row.get(15)?,
        redeem_script: row.get(16)?,
        their_public_key: row.get(17)?,
        lightning_currency: row.get(18)?,
        node: row.get(19)?,
        status: status_from_str(&status).map_err(|e| conversion_error(20, e))?,
        miner_fee: miner_fee.map(|f| f as u64),
    })
}

fn conversion_error(col: usize, err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        err.to_string().into(),
    )
}

fn side_to_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    }
}

fn side_from_str(s: &str) -> Result<OrderSide> {
    match s {
        "buy" => Ok(OrderSide::Buy),
        "sell" => Ok(OrderSide::Sell),
        other => anyhow::bail!("unknown order side: {other}"),
    }
}

fn version_to_str(version: SwapVersion) -> &'static str {
    match version {
        SwapVersion::Legacy => "legacy",
        SwapVersion::Taproot => "taproot",
    }
}

fn version_from_str(s: &str) -> Result<SwapVersion> {
    match s {
        "legacy" => Ok(SwapVersion::Legacy),
        "taproot" => Ok(SwapVersion::Taproot),
        other => anyhow::bail!("unknown swap version: {other}"),
    }
}

fn status_from_str(s: &str) -> Result<SwapUpdateEvent> {
    SwapUpdateEvent::parse(s).with_context(|| format!("unknown swap status: {s}"))
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swaps (
  id TEXT PRIMARY KEY,
  pair TEXT NOT NULL,
  order_side TEXT NOT NULL,
  version TEXT NOT NULL,
  invoice TEXT,
  preimage_hash TEXT NOT NULL,
  lockup_address TEXT NOT NULL,
  timeout_block_height INTEGER NOT NULL,
  expected_amount INTEGER NOT NULL,
  onchain_amount INTEGER NOT NULL DEFAULT 0,
  lockup_transaction_id TEXT,
  lockup_transaction_vout INTEGER,
  key_index INTEGER NOT NULL,
  redeem_script TEXT,
  their_public_key TEXT,
  rate REAL,
  status TEXT NOT NULL,
  miner_fee INTEGER
);
CREATE INDEX IF NOT EXISTS swaps_status_idx ON swaps(status);
CREATE INDEX IF NOT EXISTS swaps_invoice_idx ON swaps(invoice);

CREATE TABLE IF NOT EXISTS reverse_swaps (
  id TEXT PRIMARY KEY,
  pair TEXT NOT NULL,
  order_side TEXT NOT NULL,
  version TEXT NOT NULL,
  invoice TEXT NOT NULL,
  preimage_hash TEXT NOT NULL,
  preimage TEXT,
  lockup_address TEXT NOT NULL,
  timeout_block_height INTEGER NOT NULL,
  onchain_amount INTEGER NOT NULL,
  claim_address TEXT,
  miner_fee_invoice TEXT,
  miner_fee_invoice_preimage TEXT,
  minerfee_onchain_amount INTEGER,
  transaction_id TEXT,
  transaction_vout INTEGER,
  key_index INTEGER NOT NULL,
  redeem_script TEXT,
  their_public_key TEXT,
  lightning_currency TEXT NOT NULL,
  node TEXT NOT NULL,
  status TEXT NOT NULL,
  miner_fee INTEGER
);
CREATE INDEX IF NOT EXISTS reverse_swaps_status_idx ON reverse_swaps(status);

CREATE TABLE IF NOT EXISTS chain_swaps (
  id TEXT PRIMARY KEY,
  version TEXT NOT NULL,
  preimage_hash TEXT NOT NULL,
  preimage TEXT,
  status TEXT NOT NULL,
  claim_miner_fee INTEGER
);
CREATE INDEX IF NOT EXISTS chain_swaps_status_idx ON chain_swaps(status);

CREATE TABLE IF NOT EXISTS chain_swap_legs (
  swap_id TEXT NOT NULL,
  is_sending INTEGER NOT NULL,
  symbol TEXT NOT NULL,
  lockup_address TEXT NOT NULL,
  claim_address TEXT,
  expected_amount INTEGER NOT NULL,
  timeout_block_height INTEGER NOT NULL,
  transaction_id TEXT,
  transaction_vout INTEGER,
  amount INTEGER,
  key_index INTEGER NOT NULL,
  redeem_script TEXT,
  their_public_key TEXT,
  PRIMARY KEY (swap_id, is_sending)
);

CREATE TABLE IF NOT EXISTS refund_transactions (
  swap_id TEXT PRIMARY KEY,
  transaction_id TEXT NOT NULL,
  vin INTEGER,
  symbol TEXT NOT NULL,
  confirmed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS channel_creations (
  swap_id TEXT PRIMARY KEY,
  private INTEGER NOT NULL,
  inbound_liquidity INTEGER NOT NULL,
  funding_transaction_id TEXT
);

CREATE TABLE IF NOT EXISTS transaction_labels (
  transaction_id TEXT PRIMARY KEY,
  symbol TEXT NOT NULL,
  label TEXT NOT NULL
);
"#,
    )
    .context("create tables")?;
    Ok(())
}
