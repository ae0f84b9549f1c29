//! Verification: resolve a scanned code, assemble custody history, log the
//! check.
//!
//! This is the read path of the system.  It never touches batch state; its
//! only write is the append-only verification log, which records every
//! lookup whatever the outcome.  A scanner may hand us either a bare code or
//! a whole label payload; only the `code` field inside a payload is trusted,
//! everything else printed on a label is re-derived from the store.

use rusqlite::{params, Connection, OptionalExtension as _};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::batch::{batch_by_code, Batch, LABEL_SCHEMA};
use crate::error::{LedgerError, Result};
use crate::ledger::{transfers_for_batch, Transfer};
use crate::medicine::{medicine_by_id, Medicine};
use crate::party::{party_by_id, Party};
use crate::store::{classify, stored_uuid, Store};
use crate::util;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOutcome {
    Authentic,
    NotFound,
    Error,
}

impl VerifyOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            VerifyOutcome::Authentic => "authentic",
            VerifyOutcome::NotFound => "not_found",
            VerifyOutcome::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<VerifyOutcome> {
        match s {
            "authentic" => Ok(VerifyOutcome::Authentic),
            "not_found" => Ok(VerifyOutcome::NotFound),
            "error" => Ok(VerifyOutcome::Error),
            other => Err(LedgerError::Validation(format!(
                "unknown verification outcome '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for VerifyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: Uuid,
    pub code: String,
    pub resolved_batch_id: Option<Uuid>,
    pub outcome: VerifyOutcome,
    pub verifier_party_id: Option<Uuid>,
    pub location: Option<String>,
    pub ts_utc: String,
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    /// Whatever the scanner decoded: a bare code or a label payload.
    pub scanned: String,
    /// Anonymous checks are allowed; a party id makes the log attributable.
    pub verifier_party_id: Option<Uuid>,
    pub location: Option<String>,
}

/// The answer handed back to whoever scanned the label.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub authentic: bool,
    /// Derived from the expiry date at lookup time, never persisted.
    pub expired: bool,
    pub batch: Option<Batch>,
    pub medicine: Option<Medicine>,
    pub manufacturer: Option<Party>,
    pub transfers: Vec<Transfer>,
    pub record: VerificationRecord,
}

// ---------------------------------------------------------------------------
// Code extraction
// ---------------------------------------------------------------------------

/// Pull the batch code out of a scanned string.  Label payloads are JSON
/// objects carrying a `code` field; anything else is treated as a bare code.
/// No other payload field is ever read.
pub fn extract_code(scanned: &str) -> String {
    let trimmed = scanned.trim();
    if trimmed.starts_with('{') {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(trimmed) {
            if let Some(serde_json::Value::String(code)) = map.get("code") {
                return code.trim().to_string();
            }
        }
    }
    trimmed.to_string()
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

enum TxOut {
    Done(Box<Verification>),
    /// The store resolved the code but its referenced rows are gone.  The
    /// error-outcome record still has to commit, so the failure is raised
    /// only after the transaction closes.
    Corrupt(String),
}

/// Resolve a scanned code and append a verification record.  An unknown code
/// is a business outcome (`authentic: false`), not an error; the call only
/// fails on store-level faults.
pub fn verify(store: &mut Store, req: VerifyRequest) -> Result<Verification> {
    if let Some(ref loc) = req.location {
        util::validate_name(loc, "location")?;
    }
    let code = extract_code(&req.scanned);
    if code.is_empty() {
        return Err(LedgerError::Validation("scanned input holds no code".into()));
    }

    let out = store.immediate("verify", |tx| {
        if let Some(verifier) = req.verifier_party_id {
            if party_by_id(tx, verifier)?.is_none() {
                return Err(LedgerError::NotFound(format!("party {verifier}")));
            }
        }

        let batch = batch_by_code(tx, &code)?;
        let Some(batch) = batch else {
            let record = append_record(tx, &code, None, VerifyOutcome::NotFound, &req)?;
            return Ok(TxOut::Done(Box::new(Verification {
                authentic: false,
                expired: false,
                batch: None,
                medicine: None,
                manufacturer: None,
                transfers: Vec::new(),
                record,
            })));
        };

        let medicine = medicine_by_id(tx, batch.medicine_id)?;
        let manufacturer = party_by_id(tx, batch.manufacturer_id)?;
        let (Some(medicine), Some(manufacturer)) = (medicine, manufacturer) else {
            append_record(tx, &code, Some(batch.id), VerifyOutcome::Error, &req)?;
            return Ok(TxOut::Corrupt(format!(
                "batch {} references missing medicine or manufacturer",
                batch.id
            )));
        };

        let transfers = transfers_for_batch(tx, batch.id)?;
        let expired = util::is_expired_on(&batch.expiry_date, util::today_utc())
            .map_err(|_| {
                LedgerError::Integrity(format!("batch {}: bad stored expiry date", batch.id))
            })?;
        let record = append_record(tx, &code, Some(batch.id), VerifyOutcome::Authentic, &req)?;
        Ok(TxOut::Done(Box::new(Verification {
            authentic: true,
            expired,
            batch: Some(batch),
            medicine: Some(medicine),
            manufacturer: Some(manufacturer),
            transfers,
            record,
        })))
    })?;

    match out {
        TxOut::Done(v) => {
            info!(
                code = %v.record.code,
                outcome = %v.record.outcome,
                expired = v.expired,
                "verification logged"
            );
            Ok(*v)
        }
        TxOut::Corrupt(what) => Err(LedgerError::Integrity(what)),
    }
}

fn append_record(
    conn: &Connection,
    code: &str,
    resolved: Option<Uuid>,
    outcome: VerifyOutcome,
    req: &VerifyRequest,
) -> Result<VerificationRecord> {
    let record = VerificationRecord {
        id: Uuid::new_v4(),
        code: code.to_string(),
        resolved_batch_id: resolved,
        outcome,
        verifier_party_id: req.verifier_party_id,
        location: req.location.clone(),
        ts_utc: util::now_utc_rfc3339(),
    };
    conn.execute(
        "INSERT INTO verifications(id,code,resolved_batch_id,outcome,verifier_party_id,location,ts_utc) \
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        params![
            record.id.to_string(),
            record.code,
            record.resolved_batch_id.map(|u| u.to_string()),
            record.outcome.as_str(),
            record.verifier_party_id.map(|u| u.to_string()),
            record.location,
            record.ts_utc,
        ],
    )
    .map_err(|e| classify(e, "insert verification"))?;
    Ok(record)
}

// ---------------------------------------------------------------------------
// Log reads
// ---------------------------------------------------------------------------

type RecordRow = (
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    String,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode(row: RecordRow) -> Result<VerificationRecord> {
    let (id, code, resolved, outcome, verifier, location, ts_utc) = row;
    let outcome = VerifyOutcome::parse(&outcome).map_err(|_| {
        LedgerError::Integrity(format!("verification {id}: bad stored outcome '{outcome}'"))
    })?;
    Ok(VerificationRecord {
        id: stored_uuid(&id, "verification id")?,
        code,
        resolved_batch_id: resolved
            .map(|b| stored_uuid(&b, "resolved batch id"))
            .transpose()?,
        outcome,
        verifier_party_id: verifier
            .map(|v| stored_uuid(&v, "verifier party id"))
            .transpose()?,
        location,
        ts_utc,
    })
}

/// The verification log, optionally narrowed to one code, oldest first.
pub fn list_verifications(store: &Store, code: Option<&str>) -> Result<Vec<VerificationRecord>> {
    let conn = store.conn();
    let mut out = Vec::new();
    match code {
        Some(c) => {
            let mut stmt = conn.prepare(
                "SELECT id,code,resolved_batch_id,outcome,verifier_party_id,location,ts_utc \
                 FROM verifications WHERE code=?1 ORDER BY ts_utc, id",
            )?;
            let rows = stmt.query_map(params![c], read_row)?;
            for row in rows {
                out.push(decode(row?)?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id,code,resolved_batch_id,outcome,verifier_party_id,location,ts_utc \
                 FROM verifications ORDER BY ts_utc, id",
            )?;
            let rows = stmt.query_map([], read_row)?;
            for row in rows {
                out.push(decode(row?)?);
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{create_batch, CreateBatch};
    use crate::medicine::{add_medicine, NewMedicine};
    use crate::party::{register_party, Actor, NewParty, Role};

    fn seeded_store() -> (Store, Actor, Batch) {
        let mut store = Store::open_in_memory().unwrap();
        let p = register_party(
            &mut store,
            NewParty {
                name: "Acme".into(),
                role: Role::Manufacturer,
                company: None,
                license_no: None,
                contact: None,
            },
        )
        .unwrap();
        let mfg = Actor::from(&p);
        let med = add_medicine(
            &mut store,
            mfg,
            NewMedicine {
                name: "Paracetamol 500mg".into(),
                drug_code: "PCM-500".into(),
                composition: "Paracetamol 500mg".into(),
                dosage: "1 tablet / 6h".into(),
                shelf_life_months: 24,
            },
        )
        .unwrap();
        let batch = create_batch(
            &mut store,
            mfg,
            CreateBatch {
                medicine_id: med.id,
                batch_number: "PCM-2026-001".into(),
                manufacture_date: "2026-01-10".into(),
                expiry_date: "2028-01-10".into(),
                quantity: 100,
            },
        )
        .unwrap();
        (store, mfg, batch)
    }

    #[test]
    fn extracts_bare_and_payload_codes() {
        assert_eq!(extract_code("RX-abc"), "RX-abc");
        assert_eq!(extract_code("  RX-abc \n"), "RX-abc");
        let payload = format!(
            r#"{{"schema":"{LABEL_SCHEMA}","code":"RX-def","batch_number":"forged"}}"#
        );
        assert_eq!(extract_code(&payload), "RX-def");
        // JSON without a code field falls back to the raw string
        assert_eq!(extract_code(r#"{"batch":"x"}"#), r#"{"batch":"x"}"#);
        assert_eq!(extract_code("{not json"), "{not json");
    }

    #[test]
    fn authentic_code_returns_full_history() {
        let (mut store, _mfg, batch) = seeded_store();
        let v = verify(
            &mut store,
            VerifyRequest {
                scanned: batch.code.clone(),
                verifier_party_id: None,
                location: Some("Lagos".into()),
            },
        )
        .unwrap();
        assert!(v.authentic);
        assert!(!v.expired);
        assert_eq!(v.batch.as_ref().unwrap().id, batch.id);
        assert_eq!(v.medicine.as_ref().unwrap().drug_code, "PCM-500");
        assert_eq!(v.record.outcome, VerifyOutcome::Authentic);
        assert!(v.transfers.is_empty());
    }

    #[test]
    fn label_payload_is_resolved_via_code_only() {
        let (mut store, _mfg, batch) = seeded_store();
        let med = crate::medicine::get_medicine(&store, batch.medicine_id).unwrap();
        // forge every informational field; only the code matters
        let mut payload = crate::batch::label_payload(&batch, &med);
        payload["batch_number"] = serde_json::Value::String("FORGED".into());
        payload["expiry_date"] = serde_json::Value::String("2099-01-01".into());
        let v = verify(
            &mut store,
            VerifyRequest {
                scanned: payload.to_string(),
                verifier_party_id: None,
                location: None,
            },
        )
        .unwrap();
        assert!(v.authentic);
        assert_eq!(v.batch.as_ref().unwrap().batch_number, "PCM-2026-001");
        assert_eq!(v.batch.as_ref().unwrap().expiry_date, "2028-01-10");
    }

    #[test]
    fn unknown_code_is_logged_not_found_twice() {
        let (mut store, _mfg, _batch) = seeded_store();
        for _ in 0..2 {
            let v = verify(
                &mut store,
                VerifyRequest {
                    scanned: "RX-00000000000000000000000000000000".into(),
                    verifier_party_id: None,
                    location: None,
                },
            )
            .unwrap();
            assert!(!v.authentic);
            assert_eq!(v.record.outcome, VerifyOutcome::NotFound);
            assert!(v.batch.is_none());
        }
        let log =
            list_verifications(&store, Some("RX-00000000000000000000000000000000")).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|r| r.outcome == VerifyOutcome::NotFound));
    }

    #[test]
    fn expired_flag_is_derived_not_persisted() {
        let (mut store, mfg, _batch) = seeded_store();
        let med = crate::medicine::list_medicines(&store, Some(mfg.id)).unwrap()[0].id;
        let old = create_batch(
            &mut store,
            mfg,
            CreateBatch {
                medicine_id: med,
                batch_number: "PCM-2019-007".into(),
                manufacture_date: "2019-01-10".into(),
                expiry_date: "2021-01-10".into(),
                quantity: 5,
            },
        )
        .unwrap();

        let v = verify(
            &mut store,
            VerifyRequest {
                scanned: old.code.clone(),
                verifier_party_id: None,
                location: None,
            },
        )
        .unwrap();
        assert!(v.authentic);
        assert!(v.expired);
        // stored status untouched
        let stored = crate::ledger::get_batch(&store, old.id).unwrap();
        assert_eq!(stored.status, crate::batch::BatchStatus::Manufactured);
    }

    #[test]
    fn corrupt_reference_logs_error_outcome() {
        let (mut store, _mfg, batch) = seeded_store();
        store
            .conn()
            .execute_batch("PRAGMA foreign_keys=OFF; DELETE FROM medicines;")
            .unwrap();
        let err = verify(
            &mut store,
            VerifyRequest {
                scanned: batch.code.clone(),
                verifier_party_id: None,
                location: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::Integrity(_)));
        // the error outcome itself must have been committed
        let log = list_verifications(&store, Some(&batch.code)).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, VerifyOutcome::Error);
    }

    #[test]
    fn unknown_verifier_party_is_rejected() {
        let (mut store, _mfg, batch) = seeded_store();
        let err = verify(
            &mut store,
            VerifyRequest {
                scanned: batch.code,
                verifier_party_id: Some(Uuid::new_v4()),
                location: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }
}
