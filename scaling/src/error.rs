//! Error types and result definitions for scaling jobs.
//!
//! [`ScalingError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail, an optional source error, and the callsite that created it. Errors from
//! several workers can be aggregated into a single value.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type for scaling operations.
pub type ScalingResult<T> = Result<T, ScalingError>;

/// Detailed payload stored for single [`ScalingError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for scaling jobs.
#[derive(Debug, Clone)]
pub struct ScalingError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Multiple aggregated errors, mainly produced when several stage workers fail.
    Many {
        errors: Vec<ScalingError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors raised by the migration pipeline.
///
/// The categories follow how the pipeline reacts to them: transient errors are retried by the
/// stage that saw them, everything else escalates to the job.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Transient I/O
    SourceConnectionFailed,
    SourceIoError,
    TargetConnectionFailed,
    CoordinationUnavailable,

    // Data
    SourceQueryFailed,
    SourceReplicationCorrupted,
    TargetQueryFailed,
    TargetConstraintViolation,
    ImportRetriesExhausted,
    InvalidData,

    // Configuration
    ConfigError,
    UnknownAlgorithm,
    InvalidCheckpoint,
    SerializationError,
    DeserializationError,

    // Lock
    LockLost,
    LockNotHeld,

    // Runtime
    InvalidState,
    TaskCancelled,
    WorkerPanic,
    IoError,

    Unknown,

    // Used by failpoints to trigger specific behaviors in tests.
    #[cfg(feature = "failpoints")]
    WithTransientFailure,
    #[cfg(feature = "failpoints")]
    WithFatalFailure,
}

impl ErrorKind {
    /// Returns `true` when the failure may go away by retrying the same operation.
    pub fn is_transient(&self) -> bool {
        match self {
            ErrorKind::SourceConnectionFailed
            | ErrorKind::SourceIoError
            | ErrorKind::TargetConnectionFailed
            | ErrorKind::CoordinationUnavailable
            | ErrorKind::TargetQueryFailed
            | ErrorKind::TargetConstraintViolation
            | ErrorKind::IoError => true,
            #[cfg(feature = "failpoints")]
            ErrorKind::WithTransientFailure => true,
            _ => false,
        }
    }

    /// Returns `true` when the failure means the source change stream connection dropped.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ErrorKind::SourceConnectionFailed | ErrorKind::SourceIoError
        )
    }
}

impl ScalingError {
    /// Returns the [`ErrorKind`] of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the static description, or the first aggregated one.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.description.as_ref(),
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.description())
                .unwrap_or("multiple errors"),
        }
    }

    /// Returns the dynamic detail, or the first detail found among aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Returns `true` when every contained error is transient.
    pub fn is_transient(&self) -> bool {
        self.kinds().iter().all(ErrorKind::is_transient)
    }

    /// Attaches an originating error. Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        ScalingError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for ScalingError {
    fn eq(&self, other: &ScalingError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ScalingError {
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

                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, "\n  Detail:")?;
                    for line in detail.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write!(f, "\n  Backtrace:")?;
                    for line in backtrace.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                write!(
                    f,
                    "[Many] {} errors aggregated @ {}:{}:{}",
                    errors.len(),
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    for (line_index, line) in rendered.lines().enumerate() {
                        if line_index == 0 {
                            write!(f, "\n  {}. {line}", index + 1)?;
                        } else {
                            write!(f, "\n     {line}")?;
                        }
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for ScalingError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for ScalingError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> ScalingError {
        ScalingError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for ScalingError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> ScalingError {
        ScalingError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned as is.
impl<E> From<Vec<E>> for ScalingError
where
    E: Into<ScalingError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> ScalingError {
        let location = Location::caller();
        let mut errors: Vec<ScalingError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        ScalingError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for ScalingError {
    #[track_caller]
    fn from(err: std::io::Error) -> ScalingError {
        let detail = err.to_string();
        ScalingError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts YAML failures, which only happen while encoding or decoding checkpoints.
impl From<serde_yaml::Error> for ScalingError {
    #[track_caller]
    fn from(err: serde_yaml::Error) -> ScalingError {
        let detail = err.to_string();
        ScalingError::from_components(
            ErrorKind::InvalidCheckpoint,
            Cow::Borrowed("Job progress YAML could not be processed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<scaling_config::shared::ValidationError> for ScalingError {
    #[track_caller]
    fn from(err: scaling_config::shared::ValidationError) -> ScalingError {
        let detail = err.to_string();
        ScalingError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Process configuration is invalid"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
