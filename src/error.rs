use thiserror::Error;

/// Errors surfaced by the engine. Filesystem errors double as control flow
/// during discovery: `DeviceRemoved` unwinds the current traversal and
/// `Interrupted` aborts it at the next probe point, both leaving the store
/// consistent.
#[derive(Debug, Error)]
pub enum Error {
    /// No filesystem factory accepts this mrl's scheme.
    #[error("no filesystem factory for scheme of '{0}'")]
    UnhandledScheme(String),

    /// The device backing the current operation disappeared mid-traversal.
    #[error("device was removed during the operation")]
    DeviceRemoved,

    /// Unexpected I/O failure, carrying the OS error code when known.
    #[error("system error {code}: {message}")]
    System { code: i32, message: String },

    /// A lookup missed.
    #[error("{target} not found in {container}")]
    NotFound {
        target: &'static str,
        container: String,
    },

    /// An external collaborator did not answer within its wall clock budget.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The current operation was cancelled through its interrupt probe.
    #[error("operation interrupted")]
    Interrupted,

    /// The database failed its integrity or schema check.
    #[error("database corrupted: {0}")]
    Corrupted(String),

    #[error("malformed mrl '{0}'")]
    BadMrl(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn from_io(e: std::io::Error) -> Self {
        Error::System {
            code: e.raw_os_error().unwrap_or(-1),
            message: e.to_string(),
        }
    }

    /// Errors that should not bump a task's retry counter because retrying
    /// can not succeed until the environment changes.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DeviceRemoved | Error::Interrupted | Error::Timeout(_)
        )
    }
}

/// `UNIQUE` constraint violation, reported by the store when an insert
/// duplicates an existing row. On task creation this means "already
/// scheduled" and is not an error for the caller.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e.as_database_error().map(|d| d.kind()),
        Some(sqlx::error::ErrorKind::UniqueViolation)
    )
}

/// Foreign key violation; during track insertion this means the owning
/// media was deleted concurrently.
pub fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    matches!(
        e.as_database_error().map(|d| d.kind()),
        Some(sqlx::error::ErrorKind::ForeignKeyViolation)
    )
}

/// Any other constraint class. Seen during a migration step this is
/// interpreted as corruption.
pub fn is_constraint_violation(e: &sqlx::Error) -> bool {
    matches!(
        e.as_database_error().map(|d| d.kind()),
        Some(
            sqlx::error::ErrorKind::UniqueViolation
                | sqlx::error::ErrorKind::ForeignKeyViolation
                | sqlx::error::ErrorKind::NotNullViolation
                | sqlx::error::ErrorKind::CheckViolation
        )
    )
}
