//! Error types for prefetch operations.

use std::fmt;

/// The primary error type for all graphfetch operations.
#[derive(Debug)]
pub enum Error {
    /// Caller or model misuse (incompatible types, undeclared fields, missing FK columns)
    Usage(UsageError),
    /// State cache and engine state disagree
    Consistency(ConsistencyError),
    /// Defensive failure: an internal invariant was broken
    InvariantViolation(String),
    /// A result row could not be decoded
    Type(TypeError),
    /// Query execution errors reported by the unit of work
    Query(QueryError),
    /// Configuration errors
    Config(ConfigError),
}

#[derive(Debug)]
pub struct UsageError {
    pub kind: UsageErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    /// Requested type is not compatible with the key's type hierarchy
    IncompatibleType,
    /// Field is not declared on (or inherited by) the resolved type
    UnknownField,
    /// Owner row is missing a column the model claims is always loaded
    MissingColumn,
}

#[derive(Debug)]
pub struct ConsistencyError {
    pub message: String,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<usize>,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Results requested for a handle that was never registered or already taken
    UnknownHandle,
    /// Results requested before the queue was executed
    NotExecuted,
    /// Other execution failure
    Execution,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Create an incompatible-type usage error.
    pub fn incompatible_type(message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            kind: UsageErrorKind::IncompatibleType,
            message: message.into(),
        })
    }

    /// Create an unknown-field usage error.
    pub fn unknown_field(message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            kind: UsageErrorKind::UnknownField,
            message: message.into(),
        })
    }

    /// Create a missing-column usage error.
    pub fn missing_column(message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            kind: UsageErrorKind::MissingColumn,
            message: message.into(),
        })
    }

    /// Create a consistency error.
    pub fn consistency(message: impl Into<String>) -> Self {
        Error::Consistency(ConsistencyError {
            message: message.into(),
        })
    }

    /// Is this a usage or modeling error?
    pub fn is_usage(&self) -> bool {
        matches!(self, Error::Usage(_))
    }

    /// Get the usage error kind, if this is a usage error.
    pub fn usage_kind(&self) -> Option<UsageErrorKind> {
        match self {
            Error::Usage(u) => Some(u.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Usage(e) => write!(f, "Usage error: {}", e.message),
            Error::Consistency(e) => write!(f, "Consistency error: {}", e.message),
            Error::InvariantViolation(msg) => write!(f, "Invariant violation: {}", msg),
            Error::Type(e) => {
                if let Some(col) = e.column {
                    write!(
                        f,
                        "Type error in column {}: expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = self.column {
            write!(
                f,
                "expected {} for column {}, found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        Error::Usage(err)
    }
}

impl From<ConsistencyError> for Error {
    fn from(err: ConsistencyError) -> Self {
        Error::Consistency(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            message: format!("invalid prefetch configuration: {err}"),
            source: Some(Box::new(err)),
        })
    }
}

/// Result type alias for graphfetch operations.
pub type Result<T> = std::result::Result<T, Error>;
