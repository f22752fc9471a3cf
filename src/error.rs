//! Error handling for the agent.
//!
//! This module provides a centralized error type that encompasses every
//! failure mode the authorization pipeline can hit, from metadata transport
//! errors to certificate chain and OCSP validation failures. It uses the
//! `snafu` crate for error handling patterns, the same as the rest of this
//! codebase's host-side tooling.

use snafu::Snafu;

/// The main error enum that represents every failure kind the agent can
/// produce. Each variant maps to one taxonomy entry from the error handling
/// design: *NotAnInstance*, *InputError*, *NoKeysForUser*, *MetadataError*,
/// *TrustFailure*, or *NoValidKey*. `AcceptedAtLeastOne` has no variant
/// because it isn't an error, it's the success path.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invoked on a non-instance host"))]
    NotAnInstance,

    #[snafu(display("missing required argument: {message}"))]
    InputError { message: String },

    #[snafu(display("no active keys for user"))]
    NoKeysForUser,

    #[snafu(display("user does not exist"))]
    UnknownUser,

    #[snafu(display("metadata service error: {message}"))]
    MetadataError { message: String },

    #[snafu(display("no keys have been trusted: {message}"))]
    TrustFailure { message: String },

    #[snafu(display("no valid key among {attempted} candidate record(s)"))]
    NoValidKey { attempted: usize },

    #[snafu(display("internal error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

/// Convenience constructors for common error variants.
impl Error {
    /// Creates an internal error with a source error attached.
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        Self::MetadataError {
            message: message.into(),
        }
    }

    pub fn trust(message: impl Into<String>) -> Self {
        Self::TrustFailure {
            message: message.into(),
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::InputError {
            message: message.into(),
        }
    }

    /// Maps this error to the process exit code the error handling design
    /// specifies: `0` for the clean no-op cases, `1` for a missing
    /// argument, `255` for every fail-closed outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotAnInstance | Self::NoKeysForUser | Self::UnknownUser => 0,
            Self::InputError { .. } => 1,
            Self::MetadataError { .. }
            | Self::TrustFailure { .. }
            | Self::NoValidKey { .. }
            | Self::Internal { .. } => 255,
        }
    }

    /// Emits the diagnostic the taxonomy prescribes, at the severity it
    /// prescribes. The silent no-op cases still log at `info` so an
    /// operator tailing the journal can tell "not an instance" apart from
    /// "crashed before doing anything".
    pub fn log(&self) {
        match self {
            Self::NotAnInstance => tracing::info!("invoked on a non-instance"),
            Self::NoKeysForUser => tracing::info!("no active keys for requested user"),
            Self::UnknownUser => tracing::info!("requested user does not exist locally"),
            Self::InputError { message } => tracing::warn!(%message, "invalid invocation"),
            Self::MetadataError { message } => tracing::error!(%message, "metadata service error"),
            Self::TrustFailure { message } => tracing::warn!(%message, "no keys have been trusted"),
            Self::NoValidKey { attempted } => {
                tracing::warn!(attempted, "no valid key among candidate records")
            }
            Self::Internal { source } => match source {
                Some(e) => tracing::error!(error = %e, "internal error"),
                None => tracing::error!("internal error"),
            },
        }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::internal(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::internal(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::metadata(e.to_string())
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Self::trust(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(e)
    }
}
