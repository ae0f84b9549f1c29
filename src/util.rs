//! Hashing, time and date helpers, and input validation.

use std::path::Path;

use sha2::{Digest, Sha256};
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::error::{LedgerError, Result};

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 with microsecond precision.  The width matters: a
/// variable number of fractional digits would break the rule that sorting
/// these strings lexicographically sorts them in time.
const TS_FMT: &[time::format_description::FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

/// Current instant as an RFC 3339 UTC string.  All timestamps in the store
/// use this format, so ordering them lexicographically orders them in time.
pub fn now_utc_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&TS_FMT)
        .unwrap_or_else(|_| "1970-01-01T00:00:00.000000Z".to_string())
}

const DATE_FMT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// Parse a calendar date in `YYYY-MM-DD` form.
pub fn parse_date(s: &str) -> Result<Date> {
    Date::parse(s, &DATE_FMT)
        .map_err(|e| LedgerError::Validation(format!("invalid date '{s}': {e}")))
}

pub fn today_utc() -> Date {
    OffsetDateTime::now_utc().date()
}

/// Whether a batch with the given expiry date counts as expired on `today`.
/// The expiry day itself is still sellable; expiry begins the day after.
pub fn is_expired_on(expiry_date: &str, today: Date) -> Result<bool> {
    Ok(parse_date(expiry_date)? < today)
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Regex for manufacturer-assigned identifiers (batch numbers, drug codes):
/// starts with alphanumeric, then up to 63 more alphanumeric / hyphen / dot /
/// underscore characters.
static IDENT_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-_.]{0,63}$").unwrap()
});

/// Regex for engine-issued batch codes: `RX-` followed by 32 lowercase hex
/// characters (128 bits of OS randomness).
static CODE_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"^RX-[0-9a-f]{32}$").unwrap());

/// Validate a manufacturer-assigned identifier such as a batch number.
pub fn validate_ident(value: &str, label: &str) -> Result<()> {
    if value.is_empty() {
        return Err(LedgerError::Validation(format!("{label} must not be empty")));
    }
    if !IDENT_RE.is_match(value) {
        return Err(LedgerError::Validation(format!(
            "invalid {label} '{value}': 1-64 chars, alphanumeric/hyphen/dot/underscore"
        )));
    }
    Ok(())
}

/// Validate the format of an engine-issued batch code.
pub fn validate_code(code: &str) -> Result<()> {
    if !CODE_RE.is_match(code) {
        return Err(LedgerError::Validation(format!(
            "invalid batch code '{code}': expected RX- followed by 32 hex chars"
        )));
    }
    Ok(())
}

/// Validate a free-text name (party or medicine).  Leading/trailing
/// whitespace is rejected rather than silently trimmed so that stored names
/// compare exactly.
pub fn validate_name(value: &str, label: &str) -> Result<()> {
    if value.is_empty() {
        return Err(LedgerError::Validation(format!("{label} must not be empty")));
    }
    if value.trim() != value {
        return Err(LedgerError::Validation(format!(
            "{label} must not start or end with whitespace"
        )));
    }
    if value.len() > 120 {
        return Err(LedgerError::Validation(format!(
            "{label} too long ({} bytes, max 120)",
            value.len()
        )));
    }
    Ok(())
}

/// Validate a movement or creation quantity.
pub fn validate_quantity(quantity: u32) -> Result<()> {
    if quantity == 0 {
        return Err(LedgerError::Validation(
            "quantity must be greater than zero".into(),
        ));
    }
    Ok(())
}

/// Validate that a path is not empty and does not contain null bytes.
pub fn validate_path(p: &Path, label: &str) -> Result<()> {
    let s = p.to_string_lossy();
    if s.is_empty() {
        return Err(LedgerError::Validation(format!("{label} path is empty")));
    }
    if s.contains('\0') {
        return Err(LedgerError::Validation(format!(
            "{label} path contains null byte"
        )));
    }
    Ok(())
}

/// Maximum length of free-text notes on transfers and reports.
pub const MAX_NOTES_LEN: usize = 2_000;

/// Validate required free text (compositions, report descriptions).
pub fn validate_text(value: &str, label: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::Validation(format!("{label} must not be empty")));
    }
    if value.len() > MAX_NOTES_LEN {
        return Err(LedgerError::Validation(format!(
            "{label} too long ({} bytes, max {MAX_NOTES_LEN})",
            value.len()
        )));
    }
    Ok(())
}

/// Validate optional free-text notes.
pub fn validate_notes(notes: Option<&str>) -> Result<()> {
    if let Some(n) = notes {
        if n.len() > MAX_NOTES_LEN {
            return Err(LedgerError::Validation(format!(
                "notes too long ({} bytes, max {MAX_NOTES_LEN})",
                n.len()
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Version constants (set by build.rs)
// ---------------------------------------------------------------------------

pub const GIT_HASH: &str = env!("PHARMATRAIL_GIT_HASH");
pub const BUILD_TS: &str = env!("PHARMATRAIL_BUILD_TS");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-line version string for display.
pub fn version_string() -> String {
    format!("PharmaTrail v{VERSION} (git {GIT_HASH}, built {BUILD_TS})")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
