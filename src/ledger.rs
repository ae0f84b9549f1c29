//! The custody ledger: batch creation, transfers, sales, terminal marks.
//!
//! Every operation here is one `BEGIN IMMEDIATE` transaction.  The batch row
//! update and its transfer row commit together or not at all, which is what
//! keeps the conservation invariant (initial quantity = current quantity +
//! sum of transfer quantities) true at every observable instant.
//!
//! Transfer rows double as a tamper-evident hash chain: each row stores the
//! previous row's hash and its own, so `audit` can prove the trail was never
//! rewritten.

use rusqlite::{params, Connection, OptionalExtension as _};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::batch::{
    self, apply_movement, batch_by_code, batch_by_id, insert_batch, set_status,
    status_after_shipment, Batch, BatchStatus,
};
use crate::error::{LedgerError, OptionExt as _, Result};
use crate::medicine::medicine_by_id;
use crate::party::{party_by_id, Actor, Role};
use crate::store::{stored_uuid, Store};
use crate::util;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Shipment,
    Sale,
}

impl TransferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferKind::Shipment => "shipment",
            TransferKind::Sale => "sale",
        }
    }

    pub fn parse(s: &str) -> Result<TransferKind> {
        match s {
            "shipment" => Ok(TransferKind::Shipment),
            "sale" => Ok(TransferKind::Sale),
            other => Err(LedgerError::Validation(format!(
                "unknown transfer kind '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransferKind {
    type Err = LedgerError;
    fn from_str(s: &str) -> Result<TransferKind> {
        TransferKind::parse(s)
    }
}

/// One appended movement.  `to_party_id` is `None` for sales: consumption
/// removes units from custody instead of relocating them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub seq: i64,
    pub id: Uuid,
    pub batch_id: Uuid,
    pub from_party_id: Uuid,
    pub to_party_id: Option<Uuid>,
    pub kind: TransferKind,
    pub quantity: u32,
    pub ts_utc: String,
    pub notes: Option<String>,
    pub prev_hash_hex: String,
    pub entry_hash_hex: String,
}

#[derive(Debug, Clone)]
pub struct CreateBatch {
    pub medicine_id: Uuid,
    pub batch_number: String,
    pub manufacture_date: String,
    pub expiry_date: String,
    pub quantity: u32,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub batch_id: Uuid,
    pub to_party_id: Uuid,
    pub quantity: u32,
    pub kind: TransferKind,
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// How many fresh codes to draw before settling and letting the unique index
/// arbitrate.  With 128-bit codes a second collision in a row already means
/// something is wrong with the RNG, not with luck.
const CODE_ATTEMPTS: usize = 4;

/// Create a batch under the acting manufacturer and issue its label code.
pub fn create_batch(store: &mut Store, actor: Actor, input: CreateBatch) -> Result<Batch> {
    if actor.role != Role::Manufacturer {
        return Err(LedgerError::Forbidden(format!(
            "only a manufacturer may create batches (actor role is {})",
            actor.role
        )));
    }
    util::validate_ident(&input.batch_number, "batch number")?;
    util::validate_quantity(input.quantity)?;
    let mfg = util::parse_date(&input.manufacture_date)?;
    let exp = util::parse_date(&input.expiry_date)?;
    if exp <= mfg {
        return Err(LedgerError::Validation(format!(
            "expiry date {} must fall after manufacture date {}",
            input.expiry_date, input.manufacture_date
        )));
    }

    let batch = store.immediate("create batch", |tx| {
        let medicine = medicine_by_id(tx, input.medicine_id)?
            .required(&format!("medicine {}", input.medicine_id))?;
        if medicine.manufacturer_id != actor.id {
            return Err(LedgerError::Forbidden(format!(
                "medicine {} belongs to another manufacturer",
                medicine.id
            )));
        }

        // The immediate transaction makes check-then-insert race-free, so a
        // drawn code that is already taken can be detected directly instead
        // of being fished out of a constraint error; the unique index stays
        // as the backstop.
        let mut code = batch::generate_code();
        for _ in 1..CODE_ATTEMPTS {
            if !batch::code_exists(tx, &code)? {
                break;
            }
            code = batch::generate_code();
        }

        let now = util::now_utc_rfc3339();
        let batch = Batch {
            id: Uuid::new_v4(),
            code,
            medicine_id: medicine.id,
            manufacturer_id: actor.id,
            batch_number: input.batch_number.clone(),
            manufacture_date: input.manufacture_date.clone(),
            expiry_date: input.expiry_date.clone(),
            initial_quantity: input.quantity,
            current_quantity: input.quantity,
            current_owner_id: actor.id,
            status: BatchStatus::Manufactured,
            created_at_utc: now.clone(),
            updated_at_utc: now,
        };
        insert_batch(tx, &batch)?;
        Ok(batch)
    })?;

    info!(
        batch_id = %batch.id,
        code = %batch.code,
        quantity = batch.initial_quantity,
        "batch created"
    );
    Ok(batch)
}

/// Move `quantity` units to another party.  Decrement, ownership change,
/// status advance and the transfer row are one atomic commit.
pub fn transfer(store: &mut Store, actor: Actor, req: TransferRequest) -> Result<(Transfer, Batch)> {
    util::validate_quantity(req.quantity)?;
    util::validate_notes(req.notes.as_deref())?;
    if req.kind == TransferKind::Sale {
        return Err(LedgerError::Validation(
            "sales are recorded through record_sale, not transfer".into(),
        ));
    }

    let (transfer, updated) = store.immediate("transfer", |tx| {
        let batch = batch_by_id(tx, req.batch_id)?.required(&format!("batch {}", req.batch_id))?;
        if batch.status.is_terminal() {
            return Err(LedgerError::TerminalState {
                status: batch.status.to_string(),
            });
        }
        if batch.current_owner_id != actor.id {
            return Err(LedgerError::Forbidden(format!(
                "batch {} is held by another party",
                batch.id
            )));
        }
        if req.to_party_id == actor.id {
            return Err(LedgerError::Validation(
                "cannot transfer a batch to its current holder".into(),
            ));
        }
        let recipient = party_by_id(tx, req.to_party_id)?
            .required(&format!("party {}", req.to_party_id))?;
        if recipient.role == Role::Admin {
            return Err(LedgerError::Validation(
                "administrators do not take custody of stock".into(),
            ));
        }
        if req.quantity > batch.current_quantity {
            return Err(LedgerError::InsufficientQuantity {
                requested: req.quantity,
                available: batch.current_quantity,
            });
        }

        let ts = util::now_utc_rfc3339();
        let new_quantity = batch.current_quantity - req.quantity;
        let new_status = status_after_shipment(batch.status, recipient.role);
        if !apply_movement(
            tx,
            batch.id,
            batch.current_quantity,
            new_quantity,
            recipient.id,
            new_status,
            &ts,
        )? {
            return Err(LedgerError::Conflict(format!(
                "batch {} was concurrently modified",
                batch.id
            )));
        }

        let transfer = append_transfer(
            tx,
            batch.id,
            actor.id,
            Some(recipient.id),
            TransferKind::Shipment,
            req.quantity,
            &ts,
            req.notes.clone(),
        )?;

        let mut updated = batch;
        updated.current_quantity = new_quantity;
        updated.current_owner_id = recipient.id;
        updated.status = new_status;
        updated.updated_at_utc = ts;
        Ok((transfer, updated))
    })?;

    info!(
        batch_id = %updated.id,
        to = %req.to_party_id,
        quantity = req.quantity,
        remaining = updated.current_quantity,
        status = %updated.status,
        "transfer recorded"
    );
    Ok((transfer, updated))
}

/// Record the sale of `quantity` units by the retail holder.  The batch goes
/// Sold exactly when its quantity reaches zero this way.
pub fn record_sale(
    store: &mut Store,
    actor: Actor,
    batch_id: Uuid,
    quantity: u32,
    notes: Option<String>,
) -> Result<(Transfer, Batch)> {
    util::validate_quantity(quantity)?;
    util::validate_notes(notes.as_deref())?;
    if actor.role != Role::Retailer {
        return Err(LedgerError::Forbidden(format!(
            "only a retailer may record sales (actor role is {})",
            actor.role
        )));
    }

    let (transfer, updated) = store.immediate("record sale", |tx| {
        let batch = batch_by_id(tx, batch_id)?.required(&format!("batch {batch_id}"))?;
        if batch.status.is_terminal() {
            return Err(LedgerError::TerminalState {
                status: batch.status.to_string(),
            });
        }
        if batch.current_owner_id != actor.id {
            return Err(LedgerError::Forbidden(format!(
                "batch {} is held by another party",
                batch.id
            )));
        }
        if quantity > batch.current_quantity {
            return Err(LedgerError::InsufficientQuantity {
                requested: quantity,
                available: batch.current_quantity,
            });
        }

        let ts = util::now_utc_rfc3339();
        let new_quantity = batch.current_quantity - quantity;
        let new_status = if new_quantity == 0 {
            BatchStatus::Sold
        } else {
            batch.status
        };
        if !apply_movement(
            tx,
            batch.id,
            batch.current_quantity,
            new_quantity,
            actor.id,
            new_status,
            &ts,
        )? {
            return Err(LedgerError::Conflict(format!(
                "batch {} was concurrently modified",
                batch.id
            )));
        }

        let transfer = append_transfer(
            tx,
            batch.id,
            actor.id,
            None,
            TransferKind::Sale,
            quantity,
            &ts,
            notes.clone(),
        )?;

        let mut updated = batch;
        updated.current_quantity = new_quantity;
        updated.status = new_status;
        updated.updated_at_utc = ts;
        Ok((transfer, updated))
    })?;

    info!(
        batch_id = %updated.id,
        quantity,
        remaining = updated.current_quantity,
        status = %updated.status,
        "sale recorded"
    );
    Ok((transfer, updated))
}

/// Force a batch into Expired or Recalled.  Admins may mark any non-terminal
/// batch either way; a manufacturer may only recall a batch it currently
/// holds.
pub fn mark_expired_or_recalled(
    store: &mut Store,
    actor: Actor,
    batch_id: Uuid,
    new_status: BatchStatus,
) -> Result<Batch> {
    if !matches!(new_status, BatchStatus::Expired | BatchStatus::Recalled) {
        return Err(LedgerError::Validation(format!(
            "status '{new_status}' cannot be set directly; only expired or recalled"
        )));
    }

    let updated = store.immediate("mark batch", |tx| {
        let batch = batch_by_id(tx, batch_id)?.required(&format!("batch {batch_id}"))?;
        if batch.status.is_terminal() {
            return Err(LedgerError::TerminalState {
                status: batch.status.to_string(),
            });
        }
        match actor.role {
            Role::Admin => {}
            Role::Manufacturer => {
                if new_status != BatchStatus::Recalled {
                    return Err(LedgerError::Forbidden(
                        "a manufacturer may only mark batches recalled".into(),
                    ));
                }
                if batch.current_owner_id != actor.id {
                    return Err(LedgerError::Forbidden(format!(
                        "batch {} is held by another party",
                        batch.id
                    )));
                }
            }
            _ => {
                return Err(LedgerError::Forbidden(format!(
                    "role {} may not mark batches",
                    actor.role
                )));
            }
        }

        let ts = util::now_utc_rfc3339();
        set_status(tx, batch.id, new_status, &ts)?;
        let mut updated = batch;
        updated.status = new_status;
        updated.updated_at_utc = ts;
        Ok(updated)
    })?;

    info!(batch_id = %updated.id, status = %updated.status, "batch marked");
    Ok(updated)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub fn get_batch(store: &Store, id: Uuid) -> Result<Batch> {
    batch_by_id(store.conn(), id)?.required(&format!("batch {id}"))
}

pub fn get_batch_by_code(store: &Store, code: &str) -> Result<Batch> {
    batch_by_code(store.conn(), code)?.required(&format!("batch with code {code}"))
}

/// Inventory view: batches by holder and/or status, oldest first.
pub fn list_batches(
    store: &Store,
    owner: Option<Uuid>,
    status: Option<BatchStatus>,
) -> Result<Vec<Batch>> {
    batch::batches_filtered(store.conn(), owner, status)
}

/// The ordered custody trail of one batch.
pub fn batch_history(store: &Store, batch_id: Uuid) -> Result<Vec<Transfer>> {
    batch_by_id(store.conn(), batch_id)?.required(&format!("batch {batch_id}"))?;
    transfers_for_batch(store.conn(), batch_id)
}

// ---------------------------------------------------------------------------
// Transfer log
// ---------------------------------------------------------------------------

/// Canonical byte line a transfer row is hashed over.  Anything covered here
/// is tamper-evident through `audit`.
fn transfer_payload_line(
    batch_id: Uuid,
    from: Uuid,
    to: Option<Uuid>,
    kind: TransferKind,
    quantity: u32,
    ts_utc: &str,
    notes: Option<&str>,
) -> String {
    format!(
        "{batch_id}|{from}|{}|{kind}|{quantity}|{ts_utc}|{}",
        to.map(|u| u.to_string()).unwrap_or_default(),
        notes.unwrap_or_default(),
    )
}

#[allow(clippy::too_many_arguments)]
fn append_transfer(
    conn: &Connection,
    batch_id: Uuid,
    from: Uuid,
    to: Option<Uuid>,
    kind: TransferKind,
    quantity: u32,
    ts_utc: &str,
    notes: Option<String>,
) -> Result<Transfer> {
    let (last_seq, prev_hash): (i64, Vec<u8>) = conn
        .query_row(
            "SELECT seq, entry_hash FROM transfers ORDER BY seq DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .unwrap_or((0, vec![0u8; 32]));
    let next_seq = last_seq + 1;

    let line = transfer_payload_line(batch_id, from, to, kind, quantity, ts_utc, notes.as_deref());
    let payload_hash = util::sha256(line.as_bytes());
    let mut preimage = Vec::with_capacity(64);
    preimage.extend_from_slice(&prev_hash);
    preimage.extend_from_slice(&payload_hash);
    let entry_hash = util::sha256(&preimage);

    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO transfers(seq,id,batch_id,from_party_id,to_party_id,kind,quantity,ts_utc,notes,prev_hash,entry_hash) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        params![
            next_seq,
            id.to_string(),
            batch_id.to_string(),
            from.to_string(),
            to.map(|u| u.to_string()),
            kind.as_str(),
            quantity,
            ts_utc,
            notes,
            prev_hash,
            entry_hash.to_vec(),
        ],
    )
    .map_err(|e| crate::store::classify(e, "insert transfer"))?;

    Ok(Transfer {
        seq: next_seq,
        id,
        batch_id,
        from_party_id: from,
        to_party_id: to,
        kind,
        quantity,
        ts_utc: ts_utc.to_string(),
        notes,
        prev_hash_hex: hex::encode(prev_hash),
        entry_hash_hex: hex::encode(entry_hash),
    })
}

type TransferRow = (
    i64,
    String,
    String,
    String,
    Option<String>,
    String,
    u32,
    String,
    Option<String>,
    Vec<u8>,
    Vec<u8>,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransferRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn decode(row: TransferRow) -> Result<Transfer> {
    let (seq, id, batch_id, from, to, kind, quantity, ts_utc, notes, prev_hash, entry_hash) = row;
    let kind = TransferKind::parse(&kind)
        .map_err(|_| LedgerError::Integrity(format!("transfer {seq}: bad stored kind '{kind}'")))?;
    Ok(Transfer {
        seq,
        id: stored_uuid(&id, "transfer id")?,
        batch_id: stored_uuid(&batch_id, "batch id")?,
        from_party_id: stored_uuid(&from, "from party id")?,
        to_party_id: to.map(|t| stored_uuid(&t, "to party id")).transpose()?,
        kind,
        quantity,
        ts_utc,
        notes,
        prev_hash_hex: hex::encode(prev_hash),
        entry_hash_hex: hex::encode(entry_hash),
    })
}

/// Transfers of one batch in custody order: timestamp ascending, commit
/// sequence as the tiebreak.
pub(crate) fn transfers_for_batch(conn: &Connection, batch_id: Uuid) -> Result<Vec<Transfer>> {
    let mut stmt = conn.prepare(
        "SELECT seq,id,batch_id,from_party_id,to_party_id,kind,quantity,ts_utc,notes,prev_hash,entry_hash \
         FROM transfers WHERE batch_id=?1 ORDER BY ts_utc ASC, seq ASC",
    )?;
    let rows = stmt.query_map(params![batch_id.to_string()], read_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(decode(row?)?);
    }
    Ok(out)
}

fn all_transfers(conn: &Connection) -> Result<Vec<Transfer>> {
    let mut stmt = conn.prepare(
        "SELECT seq,id,batch_id,from_party_id,to_party_id,kind,quantity,ts_utc,notes,prev_hash,entry_hash \
         FROM transfers ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map([], read_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(decode(row?)?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub transfers_checked: u64,
    pub batches_checked: u64,
}

/// Walk the whole transfer chain and every batch, proving (a) the trail was
/// never rewritten and (b) conservation holds: initial quantity equals
/// current quantity plus everything that ever left the batch.
pub fn audit(store: &mut Store) -> Result<AuditReport> {
    let report = store.immediate("audit", |tx| {
        let transfers = all_transfers(tx)?;
        let mut prev_hash = vec![0u8; 32];
        let mut expected_seq = 1i64;
        for t in &transfers {
            if t.seq != expected_seq {
                return Err(LedgerError::Integrity(format!(
                    "transfer chain gap: expected seq {expected_seq}, found {}",
                    t.seq
                )));
            }
            if hex::encode(&prev_hash) != t.prev_hash_hex {
                return Err(LedgerError::Integrity(format!(
                    "prev_hash mismatch at seq {}",
                    t.seq
                )));
            }
            let line = transfer_payload_line(
                t.batch_id,
                t.from_party_id,
                t.to_party_id,
                t.kind,
                t.quantity,
                &t.ts_utc,
                t.notes.as_deref(),
            );
            let payload_hash = util::sha256(line.as_bytes());
            let mut preimage = Vec::with_capacity(64);
            preimage.extend_from_slice(&prev_hash);
            preimage.extend_from_slice(&payload_hash);
            let entry_hash = util::sha256(&preimage);
            if hex::encode(entry_hash) != t.entry_hash_hex {
                return Err(LedgerError::Integrity(format!(
                    "entry_hash mismatch at seq {}",
                    t.seq
                )));
            }
            prev_hash = entry_hash.to_vec();
            expected_seq += 1;
        }

        let batches = batch::batches_filtered(tx, None, None)?;
        for b in &batches {
            let moved: u32 = transfers
                .iter()
                .filter(|t| t.batch_id == b.id)
                .map(|t| t.quantity)
                .sum();
            if b.initial_quantity != b.current_quantity + moved {
                return Err(LedgerError::Integrity(format!(
                    "conservation broken for batch {}: initial {} != current {} + moved {moved}",
                    b.id, b.initial_quantity, b.current_quantity
                )));
            }
        }

        Ok(AuditReport {
            transfers_checked: transfers.len() as u64,
            batches_checked: batches.len() as u64,
        })
    })?;

    info!(
        transfers = report.transfers_checked,
        batches = report.batches_checked,
        "audit clean"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
