//! Structured error types for the PharmaTrail library.
//!
//! Every public library function returns [`Result<T>`] which carries a
//! domain-specific [`LedgerError`].  Each variant maps onto a stable
//! [`ErrorCode`] so that hosts (CLI exit codes, HTTP shims) can categorise
//! failures without parsing message text.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Primary error enum
// ---------------------------------------------------------------------------

/// Domain-specific error type for the PharmaTrail library.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed or semantically invalid input (bad quantity, unknown role,
    /// code that fails the format check, transfer to self, ...).
    #[error("validation: {0}")]
    Validation(String),

    /// A uniqueness or compare-and-set conflict (duplicate batch number,
    /// concurrent update losing the race).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A movement asked for more units than the batch currently holds.
    #[error("insufficient quantity: requested {requested}, available {available}")]
    InsufficientQuantity { requested: u32, available: u32 },

    /// The batch is in a terminal lifecycle state and admits no further
    /// movements or status changes.
    #[error("terminal state: batch is {status}")]
    TerminalState { status: String },

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store stayed locked past the configured busy timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The acting party's role or ownership does not permit the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The transfer log or stored rows fail an internal consistency check.
    #[error("integrity: {0}")]
    Integrity(String),

    #[error("config: {0}")]
    Config(String),

    /// Filesystem-level store problems (missing parent directory, unreadable
    /// database file).
    #[error("storage: {0}")]
    Storage(String),

    /// Direct database errors (auto-converted via `?` in the store module).
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, LedgerError>;

// ---------------------------------------------------------------------------
// Stable error codes
// ---------------------------------------------------------------------------

/// Integer status codes for mapping [`LedgerError`] onto process exit codes
/// or transport status fields.  `1` is left unassigned for generic failures
/// raised outside the library.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    Validation = 2,
    Conflict = 3,
    InsufficientQuantity = 4,
    TerminalState = 5,
    NotFound = 6,
    Timeout = 7,
    Forbidden = 8,
    Integrity = 9,
    Config = 10,
    Storage = 11,
    Database = 12,
}

impl From<&LedgerError> for ErrorCode {
    fn from(e: &LedgerError) -> Self {
        match e {
            LedgerError::Validation(_) => Self::Validation,
            LedgerError::Conflict(_) => Self::Conflict,
            LedgerError::InsufficientQuantity { .. } => Self::InsufficientQuantity,
            LedgerError::TerminalState { .. } => Self::TerminalState,
            LedgerError::NotFound(_) => Self::NotFound,
            LedgerError::Timeout(_) => Self::Timeout,
            LedgerError::Forbidden(_) => Self::Forbidden,
            LedgerError::Integrity(_) => Self::Integrity,
            LedgerError::Config(_) => Self::Config,
            LedgerError::Storage(_) => Self::Storage,
            LedgerError::Database(_) => Self::Database,
        }
    }
}

// ---------------------------------------------------------------------------
// Context extension traits
// ---------------------------------------------------------------------------

/// Extension trait that adds domain-specific context to any `Result<T, E>`.
///
/// Usage mirrors `anyhow::Context` but tags the error with an outcome
/// category so that callers keep a typed taxonomy instead of a string soup.
///
/// ```ignore
/// std::fs::read_to_string(path).ctx_config("read config file")?;
/// ```
pub trait ResultExt<T> {
    fn ctx_validation(self, msg: &str) -> Result<T>;
    fn ctx_config(self, msg: &str) -> Result<T>;
    fn ctx_storage(self, msg: &str) -> Result<T>;
    fn ctx_integrity(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn ctx_validation(self, msg: &str) -> Result<T> {
        self.map_err(|e| LedgerError::Validation(format!("{msg}: {e}")))
    }
    fn ctx_config(self, msg: &str) -> Result<T> {
        self.map_err(|e| LedgerError::Config(format!("{msg}: {e}")))
    }
    fn ctx_storage(self, msg: &str) -> Result<T> {
        self.map_err(|e| LedgerError::Storage(format!("{msg}: {e}")))
    }
    fn ctx_integrity(self, msg: &str) -> Result<T> {
        self.map_err(|e| LedgerError::Integrity(format!("{msg}: {e}")))
    }
}

/// Same as [`ResultExt`] but for `Option<T>` (converts `None` into
/// [`LedgerError::NotFound`]).
pub trait OptionExt<T> {
    fn required(self, what: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, what: &str) -> Result<T> {
        self.ok_or_else(|| LedgerError::NotFound(what.to_string()))
    }
}
