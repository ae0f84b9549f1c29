//! Medicine catalog.
//!
//! A medicine row is owned by the manufacturer that registered it and is
//! referenced by every batch of that product.  Identity fields (name, drug
//! code, shelf life) are fixed at registration; only the descriptive text
//! can be revised afterwards.

use rusqlite::{params, Connection, OptionalExtension as _};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{LedgerError, OptionExt as _, Result};
use crate::party::{Actor, Role};
use crate::store::{classify, stored_uuid, Store};
use crate::util;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Medicine {
    pub id: Uuid,
    pub manufacturer_id: Uuid,
    pub name: String,
    pub drug_code: String,
    pub composition: String,
    pub dosage: String,
    pub shelf_life_months: u32,
    pub created_at_utc: String,
}

#[derive(Debug, Clone)]
pub struct NewMedicine {
    pub name: String,
    pub drug_code: String,
    pub composition: String,
    pub dosage: String,
    pub shelf_life_months: u32,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Register a medicine under the acting manufacturer.  The drug code must be
/// unique within that manufacturer's catalog.
pub fn add_medicine(store: &mut Store, actor: Actor, input: NewMedicine) -> Result<Medicine> {
    if actor.role != Role::Manufacturer {
        return Err(LedgerError::Forbidden(format!(
            "only a manufacturer may register medicines (actor role is {})",
            actor.role
        )));
    }
    util::validate_name(&input.name, "medicine name")?;
    util::validate_ident(&input.drug_code, "drug code")?;
    util::validate_text(&input.composition, "composition")?;
    util::validate_text(&input.dosage, "dosage")?;
    if input.shelf_life_months == 0 {
        return Err(LedgerError::Validation(
            "shelf life must be at least one month".into(),
        ));
    }

    let medicine = Medicine {
        id: Uuid::new_v4(),
        manufacturer_id: actor.id,
        name: input.name,
        drug_code: input.drug_code,
        composition: input.composition,
        dosage: input.dosage,
        shelf_life_months: input.shelf_life_months,
        created_at_utc: util::now_utc_rfc3339(),
    };
    store.immediate("add medicine", |tx| insert_medicine(tx, &medicine))?;
    info!(medicine_id = %medicine.id, drug_code = %medicine.drug_code, "medicine registered");
    Ok(medicine)
}

pub fn get_medicine(store: &Store, id: Uuid) -> Result<Medicine> {
    medicine_by_id(store.conn(), id)?.required(&format!("medicine {id}"))
}

/// Catalog listing, optionally narrowed to one manufacturer.
pub fn list_medicines(store: &Store, manufacturer: Option<Uuid>) -> Result<Vec<Medicine>> {
    let conn = store.conn();
    let mut out = Vec::new();
    match manufacturer {
        Some(m) => {
            let mut stmt = conn.prepare(
                "SELECT id,manufacturer_id,name,drug_code,composition,dosage,shelf_life_months,created_at_utc \
                 FROM medicines WHERE manufacturer_id=?1 ORDER BY created_at_utc, id",
            )?;
            let rows = stmt.query_map(params![m.to_string()], read_row)?;
            for row in rows {
                out.push(decode(row?)?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id,manufacturer_id,name,drug_code,composition,dosage,shelf_life_months,created_at_utc \
                 FROM medicines ORDER BY created_at_utc, id",
            )?;
            let rows = stmt.query_map([], read_row)?;
            for row in rows {
                out.push(decode(row?)?);
            }
        }
    }
    Ok(out)
}

/// Revise the descriptive fields of a medicine.  Only the owning
/// manufacturer may do so; identity fields stay as registered.
pub fn update_medicine_details(
    store: &mut Store,
    actor: Actor,
    id: Uuid,
    composition: Option<String>,
    dosage: Option<String>,
) -> Result<Medicine> {
    if let Some(ref c) = composition {
        util::validate_text(c, "composition")?;
    }
    if let Some(ref d) = dosage {
        util::validate_text(d, "dosage")?;
    }

    store.immediate("update medicine details", |tx| {
        let mut med = medicine_by_id(tx, id)?.required(&format!("medicine {id}"))?;
        if med.manufacturer_id != actor.id {
            return Err(LedgerError::Forbidden(format!(
                "medicine {id} is not owned by party {}",
                actor.id
            )));
        }
        if let Some(c) = composition {
            med.composition = c;
        }
        if let Some(d) = dosage {
            med.dosage = d;
        }
        tx.execute(
            "UPDATE medicines SET composition=?2, dosage=?3 WHERE id=?1",
            params![id.to_string(), med.composition, med.dosage],
        )
        .map_err(|e| classify(e, "update medicine"))?;
        Ok(med)
    })
}

// ---------------------------------------------------------------------------
// Row access
// ---------------------------------------------------------------------------

type MedicineRow = (String, String, String, String, String, String, u32, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MedicineRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode(row: MedicineRow) -> Result<Medicine> {
    let (id, manufacturer_id, name, drug_code, composition, dosage, shelf_life_months, created_at_utc) =
        row;
    Ok(Medicine {
        id: stored_uuid(&id, "medicine id")?,
        manufacturer_id: stored_uuid(&manufacturer_id, "manufacturer id")?,
        name,
        drug_code,
        composition,
        dosage,
        shelf_life_months,
        created_at_utc,
    })
}

pub(crate) fn insert_medicine(conn: &Connection, m: &Medicine) -> Result<()> {
    conn.execute(
        "INSERT INTO medicines(id,manufacturer_id,name,drug_code,composition,dosage,shelf_life_months,created_at_utc) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        params![
            m.id.to_string(),
            m.manufacturer_id.to_string(),
            m.name,
            m.drug_code,
            m.composition,
            m.dosage,
            m.shelf_life_months,
            m.created_at_utc,
        ],
    )
    .map_err(|e| classify(e, "insert medicine"))?;
    Ok(())
}

pub(crate) fn medicine_by_id(conn: &Connection, id: Uuid) -> Result<Option<Medicine>> {
    conn.query_row(
        "SELECT id,manufacturer_id,name,drug_code,composition,dosage,shelf_life_months,created_at_utc \
         FROM medicines WHERE id=?1",
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
    use crate::party::{register_party, NewParty};

    fn manufacturer(store: &mut Store) -> Actor {
        let p = register_party(
            store,
            NewParty {
                name: "Acme Pharma".into(),
                role: Role::Manufacturer,
                company: None,
                license_no: None,
                contact: None,
            },
        )
        .unwrap();
        Actor::from(&p)
    }

    fn sample(drug_code: &str) -> NewMedicine {
        NewMedicine {
            name: "Paracetamol 500mg".into(),
            drug_code: drug_code.into(),
            composition: "Paracetamol 500mg, excipients q.s.".into(),
            dosage: "1 tablet every 6h, max 4/day".into(),
            shelf_life_months: 24,
        }
    }

    #[test]
    fn add_and_fetch() {
        let mut store = Store::open_in_memory().unwrap();
        let actor = manufacturer(&mut store);
        let med = add_medicine(&mut store, actor, sample("PCM-500")).unwrap();
        let got = get_medicine(&store, med.id).unwrap();
        assert_eq!(got.drug_code, "PCM-500");
        assert_eq!(got.manufacturer_id, actor.id);
    }

    #[test]
    fn drug_code_unique_per_manufacturer() {
        let mut store = Store::open_in_memory().unwrap();
        let actor = manufacturer(&mut store);
        add_medicine(&mut store, actor, sample("PCM-500")).unwrap();
        let err = add_medicine(&mut store, actor, sample("PCM-500")).unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));

        // A different manufacturer may reuse the code.
        let other = manufacturer(&mut store);
        add_medicine(&mut store, other, sample("PCM-500")).unwrap();
    }

    #[test]
    fn non_manufacturer_is_forbidden() {
        let mut store = Store::open_in_memory().unwrap();
        let p = register_party(
            &mut store,
            NewParty {
                name: "CityMeds".into(),
                role: Role::Retailer,
                company: None,
                license_no: None,
                contact: None,
            },
        )
        .unwrap();
        let err = add_medicine(&mut store, Actor::from(&p), sample("PCM-500")).unwrap_err();
        assert!(matches!(err, LedgerError::Forbidden(_)));
    }

    #[test]
    fn details_update_is_owner_only() {
        let mut store = Store::open_in_memory().unwrap();
        let owner = manufacturer(&mut store);
        let med = add_medicine(&mut store, owner, sample("PCM-500")).unwrap();

        let updated = update_medicine_details(
            &mut store,
            owner,
            med.id,
            Some("Paracetamol 500mg (reformulated)".into()),
            None,
        )
        .unwrap();
        assert!(updated.composition.contains("reformulated"));
        assert_eq!(updated.dosage, med.dosage);

        let stranger = manufacturer(&mut store);
        let err =
            update_medicine_details(&mut store, stranger, med.id, None, Some("2/day".into()))
                .unwrap_err();
        assert!(matches!(err, LedgerError::Forbidden(_)));
    }

    #[test]
    fn zero_shelf_life_rejected() {
        let mut store = Store::open_in_memory().unwrap();
        let actor = manufacturer(&mut store);
        let mut input = sample("PCM-500");
        input.shelf_life_months = 0;
        let err = add_medicine(&mut store, actor, input).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
