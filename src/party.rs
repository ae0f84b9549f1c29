//! Parties and roles: the actors that hold or move custody.
//!
//! Authentication lives outside this crate.  Callers hand every ledger
//! operation an already-authenticated [`Actor`]; this module only stores the
//! party registry those actors come from.

use rusqlite::{params, Connection, OptionalExtension as _};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{LedgerError, OptionExt as _, Result};
use crate::store::{classify, stored_uuid, Store};
use crate::util;

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manufacturer,
    Distributor,
    Retailer,
    Consumer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manufacturer => "manufacturer",
            Role::Distributor => "distributor",
            Role::Retailer => "retailer",
            Role::Consumer => "consumer",
        }
    }

    pub fn parse(s: &str) -> Result<Role> {
        match s {
            "admin" => Ok(Role::Admin),
            "manufacturer" => Ok(Role::Manufacturer),
            "distributor" => Ok(Role::Distributor),
            "retailer" => Ok(Role::Retailer),
            "consumer" => Ok(Role::Consumer),
            other => Err(LedgerError::Validation(format!(
                "unknown role '{other}' (expected admin/manufacturer/distributor/retailer/consumer)"
            ))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = LedgerError;
    fn from_str(s: &str) -> Result<Role> {
        Role::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
    pub company: Option<String>,
    pub license_no: Option<String>,
    pub contact: Option<String>,
    pub created_at_utc: String,
}

/// The authenticated identity an external collaborator attaches to a call.
/// The ledger trusts it as-is; it performs authorisation, not authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl From<&Party> for Actor {
    fn from(p: &Party) -> Self {
        Actor {
            id: p.id,
            role: p.role,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewParty {
    pub name: String,
    pub role: Role,
    pub company: Option<String>,
    pub license_no: Option<String>,
    pub contact: Option<String>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Register a party and return its stored form.
pub fn register_party(store: &mut Store, input: NewParty) -> Result<Party> {
    util::validate_name(&input.name, "party name")?;
    for (field, label) in [
        (&input.company, "company"),
        (&input.license_no, "license number"),
        (&input.contact, "contact"),
    ] {
        if let Some(v) = field {
            util::validate_name(v, label)?;
        }
    }

    let party = Party {
        id: Uuid::new_v4(),
        name: input.name,
        role: input.role,
        company: input.company,
        license_no: input.license_no,
        contact: input.contact,
        created_at_utc: util::now_utc_rfc3339(),
    };
    store.immediate("register party", |tx| insert_party(tx, &party))?;
    info!(party_id = %party.id, role = %party.role, "party registered");
    Ok(party)
}

pub fn get_party(store: &Store, id: Uuid) -> Result<Party> {
    party_by_id(store.conn(), id)?.required(&format!("party {id}"))
}

/// All parties, optionally narrowed to one role, oldest first.
pub fn list_parties(store: &Store, role: Option<Role>) -> Result<Vec<Party>> {
    let conn = store.conn();
    let mut out = Vec::new();
    match role {
        Some(r) => {
            let mut stmt = conn.prepare(
                "SELECT id,name,role,company,license_no,contact,created_at_utc \
                 FROM parties WHERE role=?1 ORDER BY created_at_utc, id",
            )?;
            let rows = stmt.query_map(params![r.as_str()], read_row)?;
            for row in rows {
                out.push(decode(row?)?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id,name,role,company,license_no,contact,created_at_utc \
                 FROM parties ORDER BY created_at_utc, id",
            )?;
            let rows = stmt.query_map([], read_row)?;
            for row in rows {
                out.push(decode(row?)?);
            }
        }
    }
    Ok(out)
}

/// Resolve a party id into the [`Actor`] descriptor ledger calls expect.
pub fn resolve_actor(store: &Store, id: Uuid) -> Result<Actor> {
    Ok(Actor::from(&get_party(store, id)?))
}

// ---------------------------------------------------------------------------
// Row access
// ---------------------------------------------------------------------------

type PartyRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PartyRow> {
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

fn decode(row: PartyRow) -> Result<Party> {
    let (id, name, role, company, license_no, contact, created_at_utc) = row;
    let role = Role::parse(&role)
        .map_err(|_| LedgerError::Integrity(format!("party {id}: bad stored role '{role}'")))?;
    Ok(Party {
        id: stored_uuid(&id, "party id")?,
        name,
        role,
        company,
        license_no,
        contact,
        created_at_utc,
    })
}

pub(crate) fn insert_party(conn: &Connection, p: &Party) -> Result<()> {
    conn.execute(
        "INSERT INTO parties(id,name,role,company,license_no,contact,created_at_utc) \
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        params![
            p.id.to_string(),
            p.name,
            p.role.as_str(),
            p.company,
            p.license_no,
            p.contact,
            p.created_at_utc,
        ],
    )
    .map_err(|e| classify(e, "insert party"))?;
    Ok(())
}

pub(crate) fn party_by_id(conn: &Connection, id: Uuid) -> Result<Option<Party>> {
    conn.query_row(
        "SELECT id,name,role,company,license_no,contact,created_at_utc \
         FROM parties WHERE id=?1",
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

    fn mem() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn role_round_trip() {
        for r in [
            Role::Admin,
            Role::Manufacturer,
            Role::Distributor,
            Role::Retailer,
            Role::Consumer,
        ] {
            assert_eq!(Role::parse(r.as_str()).unwrap(), r);
        }
        assert!(Role::parse("auditor").is_err());
    }

    #[test]
    fn register_and_fetch() {
        let mut store = mem();
        let p = register_party(
            &mut store,
            NewParty {
                name: "Acme Pharma".into(),
                role: Role::Manufacturer,
                company: Some("Acme Pharma Ltd.".into()),
                license_no: Some("MFG-551".into()),
                contact: None,
            },
        )
        .unwrap();

        let got = get_party(&store, p.id).unwrap();
        assert_eq!(got.name, "Acme Pharma");
        assert_eq!(got.role, Role::Manufacturer);
        assert_eq!(got.license_no.as_deref(), Some("MFG-551"));
    }

    #[test]
    fn missing_party_is_not_found() {
        let store = mem();
        let err = get_party(&store, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[test]
    fn list_filters_by_role() {
        let mut store = mem();
        for (name, role) in [
            ("M1", Role::Manufacturer),
            ("D1", Role::Distributor),
            ("D2", Role::Distributor),
        ] {
            register_party(
                &mut store,
                NewParty {
                    name: name.into(),
                    role,
                    company: None,
                    license_no: None,
                    contact: None,
                },
            )
            .unwrap();
        }
        assert_eq!(list_parties(&store, None).unwrap().len(), 3);
        let dists = list_parties(&store, Some(Role::Distributor)).unwrap();
        assert_eq!(dists.len(), 2);
        assert!(dists.iter().all(|p| p.role == Role::Distributor));
    }

    #[test]
    fn rejects_bad_names() {
        let mut store = mem();
        let err = register_party(
            &mut store,
            NewParty {
                name: "  padded  ".into(),
                role: Role::Retailer,
                company: None,
                license_no: None,
                contact: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
