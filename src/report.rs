//! Counterfeit and suspicious-product reports.
//!
//! Anyone may file a report against a scanned code.  A code that matches no
//! batch is accepted with an empty link; an unresolvable code is exactly
//! the kind of signal the report queue exists for.  Only admins move a
//! report through its triage states, and doing so never touches the batch.

use rusqlite::{params, Connection, OptionalExtension as _};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::batch::batch_by_code;
use crate::error::{LedgerError, OptionExt as _, Result};
use crate::party::{party_by_id, Actor, Role};
use crate::store::{classify, stored_uuid, Store};
use crate::util;
use crate::verify::extract_code;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Investigating,
    Resolved,
    Rejected,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Investigating => "investigating",
            ReportStatus::Resolved => "resolved",
            ReportStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<ReportStatus> {
        match s {
            "pending" => Ok(ReportStatus::Pending),
            "investigating" => Ok(ReportStatus::Investigating),
            "resolved" => Ok(ReportStatus::Resolved),
            "rejected" => Ok(ReportStatus::Rejected),
            other => Err(LedgerError::Validation(format!(
                "unknown report status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReportStatus {
    type Err = LedgerError;
    fn from_str(s: &str) -> Result<ReportStatus> {
        ReportStatus::parse(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterfeitReport {
    pub id: Uuid,
    pub code: String,
    pub resolved_batch_id: Option<Uuid>,
    pub reporter_party_id: Option<Uuid>,
    pub category: String,
    pub description: String,
    pub location: Option<String>,
    pub status: ReportStatus,
    pub admin_notes: Option<String>,
    pub created_at_utc: String,
    pub updated_at_utc: String,
}

#[derive(Debug, Clone)]
pub struct NewReport {
    /// Raw scanner output; a label payload is reduced to its code.
    pub scanned: String,
    pub category: String,
    pub description: String,
    pub location: Option<String>,
    pub reporter_party_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// File a report.  The code is linked to a batch when one matches; reports
/// against unknown codes are kept with no link.
pub fn submit_report(store: &mut Store, input: NewReport) -> Result<CounterfeitReport> {
    util::validate_name(&input.category, "report category")?;
    util::validate_text(&input.description, "report description")?;
    if let Some(ref loc) = input.location {
        util::validate_name(loc, "location")?;
    }
    let code = extract_code(&input.scanned);
    if code.is_empty() {
        return Err(LedgerError::Validation("scanned input holds no code".into()));
    }

    let report = store.immediate("submit report", |tx| {
        if let Some(reporter) = input.reporter_party_id {
            if party_by_id(tx, reporter)?.is_none() {
                return Err(LedgerError::NotFound(format!("party {reporter}")));
            }
        }
        let resolved = batch_by_code(tx, &code)?.map(|b| b.id);
        let now = util::now_utc_rfc3339();
        let report = CounterfeitReport {
            id: Uuid::new_v4(),
            code: code.clone(),
            resolved_batch_id: resolved,
            reporter_party_id: input.reporter_party_id,
            category: input.category.clone(),
            description: input.description.clone(),
            location: input.location.clone(),
            status: ReportStatus::Pending,
            admin_notes: None,
            created_at_utc: now.clone(),
            updated_at_utc: now,
        };
        insert_report(tx, &report)?;
        Ok(report)
    })?;

    info!(
        report_id = %report.id,
        code = %report.code,
        resolved = report.resolved_batch_id.is_some(),
        category = %report.category,
        "report submitted"
    );
    Ok(report)
}

/// Admin triage: move a report to a new status, optionally replacing the
/// admin notes.  Resolving a report never alters the batch it points at.
pub fn update_report(
    store: &mut Store,
    actor: Actor,
    report_id: Uuid,
    new_status: ReportStatus,
    admin_notes: Option<String>,
) -> Result<CounterfeitReport> {
    if actor.role != Role::Admin {
        return Err(LedgerError::Forbidden(format!(
            "only an admin may update reports (actor role is {})",
            actor.role
        )));
    }
    if let Some(ref notes) = admin_notes {
        util::validate_text(notes, "admin notes")?;
    }

    let report = store.immediate("update report", |tx| {
        let mut report =
            report_by_id(tx, report_id)?.required(&format!("report {report_id}"))?;
        report.status = new_status;
        if let Some(notes) = admin_notes {
            report.admin_notes = Some(notes);
        }
        report.updated_at_utc = util::now_utc_rfc3339();
        tx.execute(
            "UPDATE reports SET status=?2, admin_notes=?3, updated_at_utc=?4 WHERE id=?1",
            params![
                report.id.to_string(),
                report.status.as_str(),
                report.admin_notes,
                report.updated_at_utc,
            ],
        )
        .map_err(|e| classify(e, "update report"))?;
        Ok(report)
    })?;

    info!(report_id = %report.id, status = %report.status, "report updated");
    Ok(report)
}

pub fn get_report(store: &Store, id: Uuid) -> Result<CounterfeitReport> {
    report_by_id(store.conn(), id)?.required(&format!("report {id}"))
}

/// The report queue, optionally narrowed to one status, oldest first.
pub fn list_reports(store: &Store, status: Option<ReportStatus>) -> Result<Vec<CounterfeitReport>> {
    let conn = store.conn();
    let mut out = Vec::new();
    match status {
        Some(s) => {
            let mut stmt = conn.prepare(
                "SELECT id,code,resolved_batch_id,reporter_party_id,category,description,location,\
                 status,admin_notes,created_at_utc,updated_at_utc \
                 FROM reports WHERE status=?1 ORDER BY created_at_utc, id",
            )?;
            let rows = stmt.query_map(params![s.as_str()], read_row)?;
            for row in rows {
                out.push(decode(row?)?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id,code,resolved_batch_id,reporter_party_id,category,description,location,\
                 status,admin_notes,created_at_utc,updated_at_utc \
                 FROM reports ORDER BY created_at_utc, id",
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
// Row access
// ---------------------------------------------------------------------------

type ReportRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReportRow> {
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

fn decode(row: ReportRow) -> Result<CounterfeitReport> {
    let (
        id,
        code,
        resolved,
        reporter,
        category,
        description,
        location,
        status,
        admin_notes,
        created_at_utc,
        updated_at_utc,
    ) = row;
    let status = ReportStatus::parse(&status)
        .map_err(|_| LedgerError::Integrity(format!("report {id}: bad stored status '{status}'")))?;
    Ok(CounterfeitReport {
        id: stored_uuid(&id, "report id")?,
        code,
        resolved_batch_id: resolved
            .map(|b| stored_uuid(&b, "resolved batch id"))
            .transpose()?,
        reporter_party_id: reporter
            .map(|r| stored_uuid(&r, "reporter party id"))
            .transpose()?,
        category,
        description,
        location,
        status,
        admin_notes,
        created_at_utc,
        updated_at_utc,
    })
}

fn insert_report(conn: &Connection, r: &CounterfeitReport) -> Result<()> {
    conn.execute(
        "INSERT INTO reports(id,code,resolved_batch_id,reporter_party_id,category,description,\
         location,status,admin_notes,created_at_utc,updated_at_utc) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        params![
            r.id.to_string(),
            r.code,
            r.resolved_batch_id.map(|u| u.to_string()),
            r.reporter_party_id.map(|u| u.to_string()),
            r.category,
            r.description,
            r.location,
            r.status.as_str(),
            r.admin_notes,
            r.created_at_utc,
            r.updated_at_utc,
        ],
    )
    .map_err(|e| classify(e, "insert report"))?;
    Ok(())
}

fn report_by_id(conn: &Connection, id: Uuid) -> Result<Option<CounterfeitReport>> {
    conn.query_row(
        "SELECT id,code,resolved_batch_id,reporter_party_id,category,description,location,\
         status,admin_notes,created_at_utc,updated_at_utc \
         FROM reports WHERE id=?1",
        params![id.to_string()],
        read_row,
    )
    .optional()?
    .map(decode)
    .transpose()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{create_batch, CreateBatch};
    use crate::medicine::{add_medicine, NewMedicine};
    use crate::party::{register_party, NewParty};

    fn seeded() -> (Store, Actor, String) {
        let mut store = Store::open_in_memory().unwrap();
        let admin = register_party(
            &mut store,
            NewParty {
                name: "Root".into(),
                role: Role::Admin,
                company: None,
                license_no: None,
                contact: None,
            },
        )
        .unwrap();
        let mfg = register_party(
            &mut store,
            NewParty {
                name: "Acme Pharma".into(),
                role: Role::Manufacturer,
                company: Some("Acme Pharma Ltd".into()),
                license_no: Some("MFG-001".into()),
                contact: None,
            },
        )
        .unwrap();
        let mfg = Actor::from(&mfg);
        let med = add_medicine(
            &mut store,
            mfg,
            NewMedicine {
                name: "Paracetamol 500mg".into(),
                drug_code: "PCM-500".into(),
                composition: "Paracetamol 500mg".into(),
                dosage: "1 tablet every 6 hours".into(),
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
                quantity: 10,
            },
        )
        .unwrap();
        (store, Actor::from(&admin), batch.code)
    }

    fn sample(scanned: &str) -> NewReport {
        NewReport {
            scanned: scanned.into(),
            category: "counterfeit".into(),
            description: "Hologram missing, blister misprinted".into(),
            location: Some("Lagos".into()),
            reporter_party_id: None,
        }
    }

    #[test]
    fn known_code_links_batch() {
        let (mut store, _admin, code) = seeded();
        let r = submit_report(&mut store, sample(&code)).unwrap();
        assert_eq!(r.status, ReportStatus::Pending);
        assert!(r.resolved_batch_id.is_some());
        assert_eq!(r.code, code);
    }

    #[test]
    fn unknown_code_is_kept_unlinked() {
        let (mut store, _admin, _code) = seeded();
        let r = submit_report(&mut store, sample("RX-ffffffffffffffffffffffffffffffff")).unwrap();
        assert!(r.resolved_batch_id.is_none());
        assert_eq!(r.status, ReportStatus::Pending);
    }

    #[test]
    fn label_payload_is_reduced_to_code() {
        let (mut store, _admin, code) = seeded();
        let scanned = format!("{{\"schema\":\"pharmatrail.label.v1\",\"code\":\"{code}\"}}");
        let r = submit_report(&mut store, sample(&scanned)).unwrap();
        assert_eq!(r.code, code);
        assert!(r.resolved_batch_id.is_some());
    }

    #[test]
    fn unknown_reporter_is_rejected() {
        let (mut store, _admin, code) = seeded();
        let mut input = sample(&code);
        input.reporter_party_id = Some(Uuid::new_v4());
        let err = submit_report(&mut store, input).unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[test]
    fn triage_is_admin_only() {
        let (mut store, admin, code) = seeded();
        let r = submit_report(&mut store, sample(&code)).unwrap();

        let updated = update_report(
            &mut store,
            admin,
            r.id,
            ReportStatus::Investigating,
            Some("sample requested from reporter".into()),
        )
        .unwrap();
        assert_eq!(updated.status, ReportStatus::Investigating);
        assert_eq!(
            updated.admin_notes.as_deref(),
            Some("sample requested from reporter")
        );

        let outsider = Actor {
            id: Uuid::new_v4(),
            role: Role::Retailer,
        };
        let err =
            update_report(&mut store, outsider, r.id, ReportStatus::Rejected, None).unwrap_err();
        assert!(matches!(err, LedgerError::Forbidden(_)));
    }

    #[test]
    fn resolving_report_leaves_batch_alone() {
        let (mut store, admin, code) = seeded();
        let r = submit_report(&mut store, sample(&code)).unwrap();
        let before = crate::ledger::get_batch_by_code(&store, &code).unwrap();
        update_report(&mut store, admin, r.id, ReportStatus::Resolved, None).unwrap();
        let after = crate::ledger::get_batch_by_code(&store, &code).unwrap();
        assert_eq!(before.status, after.status);
        assert_eq!(before.current_quantity, after.current_quantity);
        assert_eq!(before.updated_at_utc, after.updated_at_utc);
    }

    #[test]
    fn unknown_report_id_is_not_found() {
        let (mut store, admin, _code) = seeded();
        let err = update_report(
            &mut store,
            admin,
            Uuid::new_v4(),
            ReportStatus::Resolved,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[test]
    fn queue_filters_by_status() {
        let (mut store, admin, code) = seeded();
        let a = submit_report(&mut store, sample(&code)).unwrap();
        submit_report(&mut store, sample("RX-ffffffffffffffffffffffffffffffff")).unwrap();
        update_report(&mut store, admin, a.id, ReportStatus::Investigating, None).unwrap();

        assert_eq!(list_reports(&store, None).unwrap().len(), 2);
        let pending = list_reports(&store, Some(ReportStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        let investigating = list_reports(&store, Some(ReportStatus::Investigating)).unwrap();
        assert_eq!(investigating.len(), 1);
        assert_eq!(investigating[0].id, a.id);
    }
}
