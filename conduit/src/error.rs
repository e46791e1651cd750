//! Error types and result definitions shared by every conduit component.
//!
//! A [`ConduitError`] is either a single classified error, carrying a static description, an
//! optional dynamic detail, an optional native code (such as a SQLSTATE) and the callsite where
//! it was raised, or an aggregate of several errors.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Result type used throughout the crate.
pub type ConduitResult<T> = Result<T, ConduitError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    code: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the crate.
#[derive(Debug, Clone)]
pub struct ConduitError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(Box<ErrorPayload>),
    /// Several independent failures, e.g. from concurrently running tasks.
    Many {
        errors: Vec<ConduitError>,
        location: &'static Location<'static>,
    },
}

/// Classification of a failure, driving retry and error-policy decisions.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorKind {
    // Pre-flight
    ConfigInvalid,

    // Data
    ValidationFailed,
    QueryInvalid,
    ConstraintViolated,
    ConversionError,

    // Availability
    Transient,
    ConnectFailed,
    DisconnectFailed,
    SourceUnavailable,
    TargetUnavailable,
    AcquireTimeout,
    PoolClosed,

    // Capability and access
    Unsupported,
    PermissionDenied,
    NotFound,

    // Run outcome
    Cancelled,
    Timeout,

    // Programming and state errors
    InvalidState,
    Internal,

    // IO and serialization
    IoError,
    SerializationError,
    DeserializationError,

    Unknown,

    // Only produced through fault injection.
    #[cfg(feature = "failpoints")]
    InjectedTransient,
    #[cfg(feature = "failpoints")]
    InjectedFatal,
}

impl ErrorKind {
    /// Returns `true` for failures that may succeed when the operation is repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            ErrorKind::Transient
            | ErrorKind::AcquireTimeout
            | ErrorKind::ConnectFailed
            | ErrorKind::IoError => true,
            #[cfg(feature = "failpoints")]
            ErrorKind::InjectedTransient => true,
            _ => false,
        }
    }
}

impl ConduitError {
    /// Returns the kind of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every kind present in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the static description of the error.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { .. } => "multiple errors",
        }
    }

    /// Returns the dynamic detail, or the first one found in an aggregate.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the native code reported by the external system, e.g. a SQLSTATE.
    pub fn code(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.code.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.code()),
        }
    }

    /// Returns `true` when every contained error is transient.
    pub fn is_transient(&self) -> bool {
        self.kinds().iter().all(ErrorKind::is_transient)
    }

    /// Returns the backtrace captured when the error was created, if enabled.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the source location where the error was created.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches the originating error. Aggregates are left unchanged.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    /// Attaches a native error code. Aggregates are left unchanged.
    pub fn with_code(mut self, code: impl Into<Cow<'static, str>>) -> Self {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.code = Some(code.into());
        }
        self
    }

    /// Re-classifies the error, keeping description, detail and source.
    ///
    /// Used at component boundaries, e.g. to report a failing source adapter as
    /// [`ErrorKind::SourceUnavailable`].
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.kind = kind;
        }
        self
    }

    /// Returns a single line `kind: description (detail)` rendering for user facing surfaces.
    pub fn summary(&self) -> String {
        match self.detail() {
            Some(detail) => format!("{:?}: {} ({detail})", self.kind(), self.description()),
            None => format!("{:?}: {}", self.kind(), self.description()),
        }
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        ConduitError {
            repr: ErrorRepr::Single(Box::new(ErrorPayload {
                kind,
                description,
                detail,
                code: None,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            })),
        }
    }
}

impl PartialEq for ConduitError {
    fn eq(&self, other: &ConduitError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Hash for ConduitError {
    /// Hashes kind and static description only so that occurrences of the same failure group
    /// together regardless of detail or callsite.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for ConduitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(code) = &payload.code {
                    write!(f, "\n  Code: {code}")?;
                }
                write_block(f, "Detail", payload.detail.as_deref())?;

                // Stack traces stay out of release builds.
                if cfg!(debug_assertions) {
                    let rendered = payload.backtrace.to_string();
                    write_block(f, "Backtrace", Some(rendered.as_str()).filter(|b| !b.trim().is_empty()))?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    errors.len(),
                    if errors.len() == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for ConduitError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, title: &str, body: Option<&str>) -> fmt::Result {
    let Some(body) = body else {
        return Ok(());
    };

    write!(f, "\n  {title}:")?;
    for line in body.lines() {
        write!(f, "\n    {line}")?;
    }

    Ok(())
}

impl From<(ErrorKind, &'static str)> for ConduitError {
    #[track_caller]
    fn from((kind, description): (ErrorKind, &'static str)) -> ConduitError {
        ConduitError::from_components(kind, Cow::Borrowed(description), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for ConduitError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, description, detail): (ErrorKind, &'static str, D)) -> ConduitError {
        ConduitError::from_components(kind, Cow::Borrowed(description), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned unwrapped.
impl<E> From<Vec<E>> for ConduitError
where
    E: Into<ConduitError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> ConduitError {
        let location = Location::caller();
        let mut errors: Vec<ConduitError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        ConduitError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

/// Builds an error that keeps `err` as its source and its message as detail.
#[track_caller]
fn wrap<E>(kind: ErrorKind, description: &'static str, err: E) -> ConduitError
where
    E: error::Error + Send + Sync + 'static,
{
    let detail = err.to_string();
    ConduitError::from_components(
        kind,
        Cow::Borrowed(description),
        Some(Cow::Owned(detail)),
        Some(Arc::new(err)),
    )
}

impl From<std::io::Error> for ConduitError {
    #[track_caller]
    fn from(err: std::io::Error) -> ConduitError {
        wrap(ErrorKind::IoError, "I/O operation failed", err)
    }
}

impl From<serde_json::Error> for ConduitError {
    #[track_caller]
    fn from(err: serde_json::Error) -> ConduitError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };
        wrap(kind, description, err)
    }
}

impl From<std::num::ParseIntError> for ConduitError {
    #[track_caller]
    fn from(err: std::num::ParseIntError) -> ConduitError {
        wrap(ErrorKind::ConversionError, "Integer parsing failed", err)
    }
}

impl From<std::num::ParseFloatError> for ConduitError {
    #[track_caller]
    fn from(err: std::num::ParseFloatError) -> ConduitError {
        wrap(ErrorKind::ConversionError, "Float parsing failed", err)
    }
}

impl From<std::str::ParseBoolError> for ConduitError {
    #[track_caller]
    fn from(err: std::str::ParseBoolError) -> ConduitError {
        wrap(ErrorKind::ConversionError, "Boolean parsing failed", err)
    }
}

impl From<uuid::Error> for ConduitError {
    #[track_caller]
    fn from(err: uuid::Error) -> ConduitError {
        wrap(ErrorKind::ConversionError, "UUID parsing failed", err)
    }
}

impl From<chrono::ParseError> for ConduitError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> ConduitError {
        wrap(ErrorKind::ConversionError, "Date or time parsing failed", err)
    }
}

impl From<bigdecimal::ParseBigDecimalError> for ConduitError {
    #[track_caller]
    fn from(err: bigdecimal::ParseBigDecimalError) -> ConduitError {
        wrap(ErrorKind::ConversionError, "Decimal parsing failed", err)
    }
}

impl From<regex::Error> for ConduitError {
    #[track_caller]
    fn from(err: regex::Error) -> ConduitError {
        wrap(ErrorKind::ConfigInvalid, "Invalid regular expression", err)
    }
}

impl From<tokio::time::error::Elapsed> for ConduitError {
    #[track_caller]
    fn from(err: tokio::time::error::Elapsed) -> ConduitError {
        wrap(ErrorKind::Transient, "Operation timed out", err)
    }
}

impl From<conduit_config::shared::ValidationError> for ConduitError {
    #[track_caller]
    fn from(err: conduit_config::shared::ValidationError) -> ConduitError {
        wrap(ErrorKind::ConfigInvalid, "Invalid configuration", err)
    }
}

impl From<conduit_config::StrictConfigError> for ConduitError {
    #[track_caller]
    fn from(err: conduit_config::StrictConfigError) -> ConduitError {
        wrap(ErrorKind::ConfigInvalid, "Invalid configuration", err)
    }
}

impl From<conduit_postgres::connect::ConnectError> for ConduitError {
    #[track_caller]
    fn from(err: conduit_postgres::connect::ConnectError) -> ConduitError {
        match err {
            conduit_postgres::connect::ConnectError::Postgres(err) => {
                let error = ConduitError::from(err);
                if error.kind() == ErrorKind::Transient {
                    error.with_kind(ErrorKind::ConnectFailed)
                } else {
                    error
                }
            }
            other => wrap(ErrorKind::ConnectFailed, "PostgreSQL TLS setup failed", other),
        }
    }
}

/// Maps a SQLSTATE to the taxonomy, by class first and by exact code where a class is mixed.
pub(crate) fn classify_sqlstate(code: &str) -> (ErrorKind, &'static str) {
    match code {
        "42501" => (ErrorKind::PermissionDenied, "PostgreSQL insufficient privilege"),
        "57014" => (ErrorKind::Transient, "PostgreSQL statement canceled or timed out"),
        "55P03" => (ErrorKind::Transient, "PostgreSQL lock not available"),
        "3D000" => (ErrorKind::NotFound, "PostgreSQL database does not exist"),
        "3F000" => (ErrorKind::NotFound, "PostgreSQL schema does not exist"),
        "42P01" => (ErrorKind::NotFound, "PostgreSQL relation does not exist"),
        _ => match code.get(..2).unwrap_or_default() {
            "08" => (ErrorKind::Transient, "PostgreSQL connection failed"),
            "28" => (ErrorKind::PermissionDenied, "PostgreSQL authentication failed"),
            "23" => (ErrorKind::ConstraintViolated, "PostgreSQL constraint violation"),
            "22" => (ErrorKind::ConversionError, "PostgreSQL data conversion failed"),
            "42" => (ErrorKind::QueryInvalid, "PostgreSQL syntax or schema error"),
            "40" => (ErrorKind::Transient, "PostgreSQL transaction rolled back"),
            "53" => (ErrorKind::Transient, "PostgreSQL insufficient resources"),
            "57" => (ErrorKind::Transient, "PostgreSQL operator intervention"),
            "58" => (ErrorKind::IoError, "PostgreSQL system error"),
            "0A" => (ErrorKind::Unsupported, "PostgreSQL feature not supported"),
            "25" => (ErrorKind::InvalidState, "PostgreSQL invalid transaction state"),
            "XX" => (ErrorKind::Internal, "PostgreSQL internal error"),
            _ => (ErrorKind::Unknown, "PostgreSQL error"),
        },
    }
}

impl From<tokio_postgres::Error> for ConduitError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> ConduitError {
        if let Some(sqlstate) = err.code() {
            let code = sqlstate.code().to_owned();
            let (kind, description) = classify_sqlstate(&code);
            let detail = err
                .as_db_error()
                .map(|db_error| db_error.message().to_owned())
                .unwrap_or_else(|| err.to_string());

            return ConduitError::from_components(
                kind,
                Cow::Borrowed(description),
                Some(Cow::Owned(detail)),
                Some(Arc::new(err)),
            )
            .with_code(code);
        }

        if err.is_closed() {
            return wrap(ErrorKind::Transient, "PostgreSQL connection closed", err);
        }

        // Errors without a SQLSTATE come from the client: IO, protocol or type conversion.
        let (kind, description) = match error::Error::source(&err) {
            Some(source) if source.is::<std::io::Error>() => {
                (ErrorKind::Transient, "PostgreSQL connection I/O failed")
            }
            Some(_) => (ErrorKind::ConversionError, "PostgreSQL value conversion failed"),
            None => (ErrorKind::Unknown, "PostgreSQL client error"),
        };
        wrap(kind, description, err)
    }
}

impl From<sqlx::Error> for ConduitError {
    #[track_caller]
    fn from(err: sqlx::Error) -> ConduitError {
        let (kind, description) = match &err {
            sqlx::Error::Database(db_error) => {
                let code = db_error.code().map(|code| code.into_owned());
                let (kind, description) = code
                    .as_deref()
                    .map(classify_sqlstate)
                    .unwrap_or((ErrorKind::Unknown, "Database error"));

                let error = wrap(kind, description, err);
                return match code {
                    Some(code) => error.with_code(code),
                    None => error,
                };
            }
            sqlx::Error::PoolTimedOut => (ErrorKind::AcquireTimeout, "Database pool timed out"),
            sqlx::Error::PoolClosed => (ErrorKind::PoolClosed, "Database pool closed"),
            sqlx::Error::Io(_) => (ErrorKind::Transient, "Database I/O failed"),
            sqlx::Error::Tls(_) => (ErrorKind::ConnectFailed, "Database TLS negotiation failed"),
            sqlx::Error::Configuration(_) => {
                (ErrorKind::ConfigInvalid, "Database configuration invalid")
            }
            sqlx::Error::RowNotFound => (ErrorKind::NotFound, "Database row not found"),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                (ErrorKind::ConversionError, "Database value decoding failed")
            }
            _ => (ErrorKind::Unknown, "Database operation failed"),
        };
        wrap(kind, description, err)
    }
}
