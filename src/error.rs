use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Database,
    Table,
    Column,
    Index,
    Transaction,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Database => write!(f, "database"),
            ResourceType::Table => write!(f, "table"),
            ResourceType::Column => write!(f, "column"),
            ResourceType::Index => write!(f, "index"),
            ResourceType::Transaction => write!(f, "transaction"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    SchemaUnavailable,
    SchemaMismatch,
    DatabaseNotFound,
    DatabaseAlreadyRegistered,
    TableNotFound,
    ColumnNotFound,
    IndexNotFound,
    TransactionNotFound,
    ConstraintViolation,
    Execution,
    Timeout,
    Cancelled,
    Unsupported,
    InvalidPageToken,
    InvalidContinuationToken,
    Backup,
    Audit,
}

impl EngineErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineErrorCode::Io => "io",
            EngineErrorCode::Encode => "encode",
            EngineErrorCode::Decode => "decode",
            EngineErrorCode::Validation => "validation",
            EngineErrorCode::InvalidConfig => "invalid_config",
            EngineErrorCode::SchemaUnavailable => "schema_unavailable",
            EngineErrorCode::SchemaMismatch => "schema_mismatch",
            EngineErrorCode::DatabaseNotFound => "database_not_found",
            EngineErrorCode::DatabaseAlreadyRegistered => "database_already_registered",
            EngineErrorCode::TableNotFound => "table_not_found",
            EngineErrorCode::ColumnNotFound => "column_not_found",
            EngineErrorCode::IndexNotFound => "index_not_found",
            EngineErrorCode::TransactionNotFound => "transaction_not_found",
            EngineErrorCode::ConstraintViolation => "constraint_violation",
            EngineErrorCode::Execution => "execution",
            EngineErrorCode::Timeout => "timeout",
            EngineErrorCode::Cancelled => "cancelled",
            EngineErrorCode::Unsupported => "unsupported",
            EngineErrorCode::InvalidPageToken => "invalid_page_token",
            EngineErrorCode::InvalidContinuationToken => "invalid_continuation_token",
            EngineErrorCode::Backup => "backup",
            EngineErrorCode::Audit => "audit",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("schema unavailable for database '{database_id}': {message}")]
    SchemaUnavailable {
        database_id: String,
        message: String,
    },
    #[error("schema mismatch on database '{database_id}' after refresh: {detail}")]
    SchemaMismatch { database_id: String, detail: String },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("database '{0}' is already registered")]
    DatabaseAlreadyRegistered(String),
    #[error("constraint violation on table '{table}': {message}")]
    ConstraintViolation { table: String, message: String },
    #[error("execution error: {message}")]
    Execution {
        message: String,
        /// The store reported a missing table/column or a stale prepared schema.
        schema_related: bool,
        /// The store itself rejected the statement on a constraint.
        constraint: bool,
    },
    #[error("deadline exceeded during {phase}")]
    Timeout { phase: &'static str },
    #[error("request cancelled before execution started")]
    Cancelled,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid page token: {0}")]
    InvalidPageToken(String),
    #[error("invalid continuation token: {0}")]
    InvalidContinuationToken(String),
    #[error("backup error: {0}")]
    Backup(String),
    #[error("audit sink error: {0}")]
    Audit(String),
}

impl EngineError {
    pub fn code(&self) -> EngineErrorCode {
        match self {
            EngineError::Io(_) => EngineErrorCode::Io,
            EngineError::Encode(_) => EngineErrorCode::Encode,
            EngineError::Decode(_) => EngineErrorCode::Decode,
            EngineError::Validation(_) => EngineErrorCode::Validation,
            EngineError::InvalidConfig { .. } => EngineErrorCode::InvalidConfig,
            EngineError::SchemaUnavailable { .. } => EngineErrorCode::SchemaUnavailable,
            EngineError::SchemaMismatch { .. } => EngineErrorCode::SchemaMismatch,
            EngineError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Database => EngineErrorCode::DatabaseNotFound,
                ResourceType::Table => EngineErrorCode::TableNotFound,
                ResourceType::Column => EngineErrorCode::ColumnNotFound,
                ResourceType::Index => EngineErrorCode::IndexNotFound,
                ResourceType::Transaction => EngineErrorCode::TransactionNotFound,
            },
            EngineError::DatabaseAlreadyRegistered(_) => {
                EngineErrorCode::DatabaseAlreadyRegistered
            }
            EngineError::ConstraintViolation { .. } => EngineErrorCode::ConstraintViolation,
            EngineError::Execution { .. } => EngineErrorCode::Execution,
            EngineError::Timeout { .. } => EngineErrorCode::Timeout,
            EngineError::Cancelled => EngineErrorCode::Cancelled,
            EngineError::Unsupported(_) => EngineErrorCode::Unsupported,
            EngineError::InvalidPageToken(_) => EngineErrorCode::InvalidPageToken,
            EngineError::InvalidContinuationToken(_) => EngineErrorCode::InvalidContinuationToken,
            EngineError::Backup(_) => EngineErrorCode::Backup,
            EngineError::Audit(_) => EngineErrorCode::Audit,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn execution(message: impl Into<String>) -> Self {
        EngineError::Execution {
            message: message.into(),
            schema_related: false,
            constraint: false,
        }
    }

    pub fn database_not_found(database_id: &str) -> Self {
        EngineError::NotFound {
            resource_type: ResourceType::Database,
            resource_id: database_id.to_string(),
        }
    }

    /// True when a failure suggests the cached schema no longer matches the store.
    pub fn is_schema_related(&self) -> bool {
        matches!(
            self,
            EngineError::Execution {
                schema_related: true,
                ..
            } | EngineError::NotFound {
                resource_type: ResourceType::Table | ResourceType::Column,
                ..
            }
        )
    }

    /// Timeouts take the same rollback path as execution failures.
    pub fn triggers_rollback(&self) -> bool {
        matches!(
            self,
            EngineError::Execution { .. } | EngineError::Timeout { .. } | EngineError::Io(_)
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(ffi_err, msg) => {
                let message = msg.clone().unwrap_or_else(|| err.to_string());
                match ffi_err.code {
                    rusqlite::ErrorCode::OperationInterrupted => EngineError::Timeout {
                        phase: "statement",
                    },
                    rusqlite::ErrorCode::ConstraintViolation => EngineError::Execution {
                        message,
                        schema_related: false,
                        constraint: true,
                    },
                    rusqlite::ErrorCode::SchemaChanged => EngineError::Execution {
                        message,
                        schema_related: true,
                        constraint: false,
                    },
                    _ => EngineError::Execution {
                        schema_related: looks_schema_related(&message),
                        message,
                        constraint: false,
                    },
                }
            }
            rusqlite::Error::SqlInputError { msg, .. } => EngineError::Execution {
                schema_related: looks_schema_related(msg),
                message: msg.clone(),
                constraint: false,
            },
            rusqlite::Error::InvalidParameterCount(expected, got) => EngineError::Validation(
                format!("expected {expected} parameters, got {got}"),
            ),
            _ => EngineError::execution(err.to_string()),
        }
    }
}

fn looks_schema_related(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("no such table")
        || lowered.contains("no such column")
        || lowered.contains("has no column named")
        || lowered.contains("schema has changed")
}
