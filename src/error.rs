#![forbid(unsafe_code)]

use thiserror::Error;

pub use crate::config::ConfigurationError;
pub use crate::replay::clock::TimestampError;
pub use crate::replay::source::RowParseError;
pub use crate::transport::TransportError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Crate-level failure. Row parse errors never reach this type: the scheduler logs and
/// counts them instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    fn wrap(self, context: String) -> Self {
        Self::Context {
            context,
            source: Box::new(self),
        }
    }

    /// Innermost error below any `Context` layers.
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::Context { source, .. } = current {
            current = source.as_ref();
        }
        current
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.root(), Error::Configuration(_))
    }

    pub fn is_timestamp(&self) -> bool {
        matches!(self.root(), Error::Timestamp(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.root(), Error::Transport(_))
    }
}

/// Attaches a human readable layer to any error convertible into [`Error`].
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C: Into<String>>(self, f: impl FnOnce() -> C) -> Result<T>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    Error: From<E>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|err| Error::from(err).wrap(context.into()))
    }

    fn with_context<C: Into<String>>(self, f: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|err| Error::from(err).wrap(f().into()))
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Message(value)
    }
}

/// `format!`-style constructor for [`Error::Message`].
#[macro_export]
macro_rules! err {
    ($($arg:tt)+) => {
        $crate::error::Error::msg(format!($($arg)+))
    };
}
