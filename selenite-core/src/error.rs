use thiserror::Error;

/// All errors produced by selenite-core.
///
/// The taxonomy matters operationally: configuration errors surface
/// synchronously at submission and never reach a worker, engine errors drive
/// the fallback/retry policy inside a worker, and `Cancelled` is a terminal
/// outcome rather than a failure.
#[derive(Debug, Error)]
pub enum SeleniteError {
    // ── Configuration / registry ─────────────────────────────────────────
    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown {kind} provider: {name}")]
    UnknownProvider { kind: String, name: String },

    #[error("unknown weight {weight} under {kind} provider {provider}")]
    UnknownWeight {
        kind: String,
        provider: String,
        weight: String,
    },

    #[error("provider {name} is disabled: {reason}")]
    ProviderDisabled { name: String, reason: String },

    #[error("weight {name} is disabled: {reason}")]
    WeightDisabled { name: String, reason: String },

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("path escapes configured root: {0}")]
    PathEscape(String),

    // ── Engines ──────────────────────────────────────────────────────────
    /// Hard engine failure — not retryable within the same job; triggers the
    /// fallback path instead.
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Transient engine failure — retryable once within the same worker.
    #[error("transient engine failure: {0}")]
    EngineTransient(String),

    /// Cooperative cancellation observed. Maps to the `cancelled` terminal
    /// state; never reported to the user as an error.
    #[error("cancelled")]
    Cancelled,

    // ── Persistence ──────────────────────────────────────────────────────
    #[error("not found: {0}")]
    NotFound(String),

    #[error("concurrent update of {0}")]
    ConcurrentUpdate(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    // ── Resources ────────────────────────────────────────────────────────
    #[error("storage full: {0}")]
    StorageFull(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SeleniteError {
    /// User-safe description persisted into `error_message`, truncated so a
    /// runaway engine message cannot bloat the row. Stack traces never pass
    /// through here.
    pub fn user_message(&self) -> String {
        truncate_message(&self.to_string())
    }
}

/// Maximum persisted length of `error_message`.
pub const ERROR_MESSAGE_MAX_BYTES: usize = 2048;

/// Truncate on a char boundary at `ERROR_MESSAGE_MAX_BYTES`.
pub fn truncate_message(raw: &str) -> String {
    if raw.len() <= ERROR_MESSAGE_MAX_BYTES {
        return raw.to_string();
    }
    let mut end = ERROR_MESSAGE_MAX_BYTES;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}

pub type Result<T> = std::result::Result<T, SeleniteError>;
