//! Batch entity, lifecycle state machine, and label codes.
//!
//! The lifecycle transition logic is pure and lives here; the ledger module
//! drives it inside transactions.  Status moves only forward:
//!
//!   Manufactured → Distributed → Delivered → Sold
//!
//! with Expired and Recalled as explicit terminal marks.  A shipment to a
//! retailer lands on Delivered; a shipment back to a manufacturer changes
//! custody but never regresses the status.

use rusqlite::{params, Connection, OptionalExtension as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::medicine::Medicine;
use crate::party::Role;
use crate::store::{classify, stored_uuid};

// ---------------------------------------------------------------------------
// Lifecycle status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Manufactured,
    Distributed,
    Delivered,
    Sold,
    Expired,
    Recalled,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Manufactured => "manufactured",
            BatchStatus::Distributed => "distributed",
            BatchStatus::Delivered => "delivered",
            BatchStatus::Sold => "sold",
            BatchStatus::Expired => "expired",
            BatchStatus::Recalled => "recalled",
        }
    }

    pub fn parse(s: &str) -> Result<BatchStatus> {
        match s {
            "manufactured" => Ok(BatchStatus::Manufactured),
            "distributed" => Ok(BatchStatus::Distributed),
            "delivered" => Ok(BatchStatus::Delivered),
            "sold" => Ok(BatchStatus::Sold),
            "expired" => Ok(BatchStatus::Expired),
            "recalled" => Ok(BatchStatus::Recalled),
            other => Err(LedgerError::Validation(format!(
                "unknown batch status '{other}'"
            ))),
        }
    }

    /// Sold, Expired and Recalled admit no further movements.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Sold | BatchStatus::Expired | BatchStatus::Recalled
        )
    }

    /// Position along the forward custody axis.  Terminal marks sit above
    /// everything so a comparison can never step a batch backwards.
    fn custody_rank(self) -> u8 {
        match self {
            BatchStatus::Manufactured => 0,
            BatchStatus::Distributed => 1,
            BatchStatus::Delivered => 2,
            BatchStatus::Sold => 3,
            BatchStatus::Expired | BatchStatus::Recalled => u8::MAX,
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = LedgerError;
    fn from_str(s: &str) -> Result<BatchStatus> {
        BatchStatus::parse(s)
    }
}

/// Status after a shipment of this batch reaches `recipient`.  Reaching a
/// retailer means delivered; any other party outside the manufacturing tier
/// means distributed; a return to a manufacturer keeps the furthest point
/// already reached.
pub fn status_after_shipment(current: BatchStatus, recipient: Role) -> BatchStatus {
    let target = match recipient {
        Role::Retailer => BatchStatus::Delivered,
        Role::Distributor | Role::Consumer => BatchStatus::Distributed,
        Role::Manufacturer | Role::Admin => current,
    };
    if target.custody_rank() > current.custody_rank() {
        target
    } else {
        current
    }
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub code: String,
    pub medicine_id: Uuid,
    pub manufacturer_id: Uuid,
    pub batch_number: String,
    pub manufacture_date: String,
    pub expiry_date: String,
    pub initial_quantity: u32,
    pub current_quantity: u32,
    pub current_owner_id: Uuid,
    pub status: BatchStatus,
    pub created_at_utc: String,
    pub updated_at_utc: String,
}

// ---------------------------------------------------------------------------
// Label codes
// ---------------------------------------------------------------------------

/// Schema tag carried by printable label payloads.
pub const LABEL_SCHEMA: &str = "pharmatrail.label.v1";

const CODE_BYTES: usize = 16;

/// Draw a fresh batch code: `RX-` plus 128 bits of OS randomness.  Global
/// uniqueness is still enforced by the store's unique index; this only makes
/// collisions astronomically unlikely rather than impossible.
pub fn generate_code() -> String {
    use rand::RngCore as _;
    let mut raw = [0u8; CODE_BYTES];
    rand::rng().fill_bytes(&mut raw);
    format!("RX-{}", hex::encode(raw))
}

/// The JSON payload printed onto a batch label.  Scanners hand the whole
/// string back to verification, which trusts only the `code` field.
pub fn label_payload(batch: &Batch, medicine: &Medicine) -> serde_json::Value {
    serde_json::json!({
        "schema": LABEL_SCHEMA,
        "code": batch.code,
        "batch_number": batch.batch_number,
        "medicine": medicine.name,
        "drug_code": medicine.drug_code,
        "manufacture_date": batch.manufacture_date,
        "expiry_date": batch.expiry_date,
    })
}

// ---------------------------------------------------------------------------
// Row access
// ---------------------------------------------------------------------------

const BATCH_COLS: &str = "id,code,medicine_id,manufacturer_id,batch_number,manufacture_date,\
                          expiry_date,initial_quantity,current_quantity,current_owner_id,\
                          status,created_at_utc,updated_at_utc";

type BatchRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    u32,
    u32,
    String,
    String,
    String,
    String,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BatchRow> {
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
        row.get(11)?,
        row.get(12)?,
    ))
}

fn decode(row: BatchRow) -> Result<Batch> {
    let (
        id,
        code,
        medicine_id,
        manufacturer_id,
        batch_number,
        manufacture_date,
        expiry_date,
        initial_quantity,
        current_quantity,
        current_owner_id,
        status,
        created_at_utc,
        updated_at_utc,
    ) = row;
    let status = BatchStatus::parse(&status)
        .map_err(|_| LedgerError::Integrity(format!("batch {id}: bad stored status '{status}'")))?;
    Ok(Batch {
        id: stored_uuid(&id, "batch id")?,
        code,
        medicine_id: stored_uuid(&medicine_id, "medicine id")?,
        manufacturer_id: stored_uuid(&manufacturer_id, "manufacturer id")?,
        batch_number,
        manufacture_date,
        expiry_date,
        initial_quantity,
        current_quantity,
        current_owner_id: stored_uuid(&current_owner_id, "owner id")?,
        status,
        created_at_utc,
        updated_at_utc,
    })
}

pub(crate) fn insert_batch(conn: &Connection, b: &Batch) -> Result<()> {
    conn.execute(
        "INSERT INTO batches(id,code,medicine_id,manufacturer_id,batch_number,manufacture_date,\
         expiry_date,initial_quantity,current_quantity,current_owner_id,status,created_at_utc,updated_at_utc) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
        params![
            b.id.to_string(),
            b.code,
            b.medicine_id.to_string(),
            b.manufacturer_id.to_string(),
            b.batch_number,
            b.manufacture_date,
            b.expiry_date,
            b.initial_quantity,
            b.current_quantity,
            b.current_owner_id.to_string(),
            b.status.as_str(),
            b.created_at_utc,
            b.updated_at_utc,
        ],
    )
    .map_err(|e| classify(e, "insert batch"))?;
    Ok(())
}

pub(crate) fn batch_by_id(conn: &Connection, id: Uuid) -> Result<Option<Batch>> {
    conn.query_row(
        &format!("SELECT {BATCH_COLS} FROM batches WHERE id=?1"),
        params![id.to_string()],
        read_row,
    )
    .optional()?
    .map(decode)
    .transpose()
}

pub(crate) fn code_exists(conn: &Connection, code: &str) -> Result<bool> {
    let hit: Option<i64> = conn
        .query_row("SELECT 1 FROM batches WHERE code=?1", params![code], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(hit.is_some())
}

pub(crate) fn batch_by_code(conn: &Connection, code: &str) -> Result<Option<Batch>> {
    conn.query_row(
        &format!("SELECT {BATCH_COLS} FROM batches WHERE code=?1"),
        params![code],
        read_row,
    )
    .optional()?
    .map(decode)
    .transpose()
}

pub(crate) fn batches_filtered(
    conn: &Connection,
    owner: Option<Uuid>,
    status: Option<BatchStatus>,
) -> Result<Vec<Batch>> {
    let mut sql = format!("SELECT {BATCH_COLS} FROM batches");
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<String> = Vec::new();
    if let Some(o) = owner {
        clauses.push("current_owner_id=?");
        args.push(o.to_string());
    }
    if let Some(s) = status {
        clauses.push("status=?");
        args.push(s.as_str().to_string());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at_utc, id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), read_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(decode(row?)?);
    }
    Ok(out)
}

/// Compare-and-set for the one contended row in the system.  The movement
/// applies only if `expected_quantity` is still current; a `false` return
/// means another writer got there first and the caller must re-read.
pub(crate) fn apply_movement(
    conn: &Connection,
    id: Uuid,
    expected_quantity: u32,
    new_quantity: u32,
    new_owner: Uuid,
    new_status: BatchStatus,
    ts_utc: &str,
) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE batches SET current_quantity=?3, current_owner_id=?4, status=?5, updated_at_utc=?6 \
             WHERE id=?1 AND current_quantity=?2",
            params![
                id.to_string(),
                expected_quantity,
                new_quantity,
                new_owner.to_string(),
                new_status.as_str(),
                ts_utc,
            ],
        )
        .map_err(|e| classify(e, "apply movement"))?;
    Ok(n == 1)
}

pub(crate) fn set_status(
    conn: &Connection,
    id: Uuid,
    new_status: BatchStatus,
    ts_utc: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE batches SET status=?2, updated_at_utc=?3 WHERE id=?1",
        params![id.to_string(), new_status.as_str(), ts_utc],
    )
    .map_err(|e| classify(e, "set batch status"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for s in [
            BatchStatus::Manufactured,
            BatchStatus::Distributed,
            BatchStatus::Delivered,
            BatchStatus::Sold,
            BatchStatus::Expired,
            BatchStatus::Recalled,
        ] {
            assert_eq!(BatchStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(BatchStatus::parse("returned").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!BatchStatus::Manufactured.is_terminal());
        assert!(!BatchStatus::Distributed.is_terminal());
        assert!(!BatchStatus::Delivered.is_terminal());
        assert!(BatchStatus::Sold.is_terminal());
        assert!(BatchStatus::Expired.is_terminal());
        assert!(BatchStatus::Recalled.is_terminal());
    }

    #[test]
    fn shipment_advances_forward() {
        use BatchStatus::*;
        assert_eq!(status_after_shipment(Manufactured, Role::Distributor), Distributed);
        assert_eq!(status_after_shipment(Manufactured, Role::Retailer), Delivered);
        assert_eq!(status_after_shipment(Distributed, Role::Retailer), Delivered);
        assert_eq!(status_after_shipment(Manufactured, Role::Consumer), Distributed);
    }

    #[test]
    fn shipment_never_regresses() {
        use BatchStatus::*;
        // delivered stock moved onward to a distributor stays delivered
        assert_eq!(status_after_shipment(Delivered, Role::Distributor), Delivered);
        // a return to the manufacturer keeps the furthest point reached
        assert_eq!(status_after_shipment(Distributed, Role::Manufacturer), Distributed);
        assert_eq!(status_after_shipment(Delivered, Role::Manufacturer), Delivered);
    }

    #[test]
    fn generated_codes_are_well_formed_and_distinct() {
        let a = generate_code();
        let b = generate_code();
        assert!(crate::util::validate_code(&a).is_ok());
        assert!(crate::util::validate_code(&b).is_ok());
        assert_ne!(a, b);
    }

    #[test]
    fn label_payload_carries_schema_and_code() {
        let batch = Batch {
            id: Uuid::new_v4(),
            code: generate_code(),
            medicine_id: Uuid::new_v4(),
            manufacturer_id: Uuid::new_v4(),
            batch_number: "PCM-2026-001".into(),
            manufacture_date: "2026-01-10".into(),
            expiry_date: "2028-01-10".into(),
            initial_quantity: 100,
            current_quantity: 100,
            current_owner_id: Uuid::new_v4(),
            status: BatchStatus::Manufactured,
            created_at_utc: crate::util::now_utc_rfc3339(),
            updated_at_utc: crate::util::now_utc_rfc3339(),
        };
        let medicine = Medicine {
            id: batch.medicine_id,
            manufacturer_id: batch.manufacturer_id,
            name: "Paracetamol 500mg".into(),
            drug_code: "PCM-500".into(),
            composition: "Paracetamol 500mg".into(),
            dosage: "1 tablet / 6h".into(),
            shelf_life_months: 24,
            created_at_utc: crate::util::now_utc_rfc3339(),
        };
        let payload = label_payload(&batch, &medicine);
        assert_eq!(payload["schema"], LABEL_SCHEMA);
        assert_eq!(payload["code"], batch.code.as_str());
        assert_eq!(payload["drug_code"], "PCM-500");
    }
}
