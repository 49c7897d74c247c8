use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Database error")]
    Database(#[from] sqlx::Error),

    #[error("Migration error")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("Serialization error")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Malformed temporal value '{value}': {reason}")]
    MalformedTemporalValue { value: String, reason: String },

    #[error("Invalid entity {uid}: {reason}")]
    InvalidEntity { uid: String, reason: String },

    #[error("Time zone '{tzid}' is unknown, substituted {substitute}")]
    UnresolvedZone { tzid: String, substitute: String },

    #[error("Ignoring opaque property {name} ({size} bytes, limit {limit})")]
    OversizeOpaqueProperty { name: String, size: usize, limit: usize },

    #[error("Persistence failure: {message}")]
    PersistenceFailure {
        message: String,
        #[source]
        source: Option<StoreError>,
    },
}

impl CoreError {
    pub(crate) fn malformed(value: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::MalformedTemporalValue {
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_entity(uid: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidEntity {
            uid: uid.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn persistence(message: impl Into<String>, source: Option<StoreError>) -> Self {
        CoreError::PersistenceFailure {
            message: message.into(),
            source,
        }
    }

    /// Recoverable conditions are reported as warnings; processing continues with a substitute.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::UnresolvedZone { .. } | CoreError::OversizeOpaqueProperty { .. }
        )
    }
}

impl From<figment::Error> for CoreError {
    fn from(err: figment::Error) -> Self {
        CoreError::Config(Box::new(err))
    }
}
