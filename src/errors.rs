use std::io;

use thiserror::Error;

use crate::gateway::capability::{Capability, Feature};

// -----------------------------------------------------------------------------
// ----- Want ------------------------------------------------------------------

/// Which socket readiness a non-blocking call is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Want {
    Read,
    Write,
}

impl Want {
    pub fn as_str(self) -> &'static str {
        match self {
            Want::Read => "readable",
            Want::Write => "writable",
        }
    }
}

// -----------------------------------------------------------------------------
// ----- LoadFailure -----------------------------------------------------------

/// Why the cryptography runtime could not be brought up. Cached by the gateway
/// and handed back to every caller after a failed initialization.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LoadFailure {
    #[error("no ssl runtime module could be loaded (tried: {})", .tried.join(", "))]
    NoModules { tried: Vec<String> },

    #[error("mandatory symbol for {capability} missing (tried: {})", .names.join(", "))]
    MandatorySymbolMissing {
        capability: Capability,
        names: Vec<&'static str>,
    },

    #[error("no usable implementation of {feature} in the installed runtime")]
    FeatureMissing { feature: Feature },

    #[error("ssl runtime initialization is already in progress on this thread")]
    InitializationInProgress,

    #[error("ssl runtime initialization panicked")]
    InitializationAborted,

    #[error("ssl runtime initialization call failed (code {code:?})")]
    RuntimeInitFailed { code: Option<u64> },
}

// -----------------------------------------------------------------------------
// ----- GatewayError ----------------------------------------------------------

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("ssl runtime not loaded: {0}")]
    LoadFailure(#[from] LoadFailure),

    #[error("{capability} is not supported by the installed ssl runtime")]
    Unsupported { capability: Capability },

    #[error("{capability} failed{}: {message}", fmt_code(.code))]
    Transport {
        capability: Capability,
        code: Option<u64>,
        message: String,
    },

    #[error("operation would block; retry once the socket is {}", .0.as_str())]
    WouldBlock(Want),

    #[error("invalid argument: {what}")]
    InvalidArgument { what: String },
}

// -----------------------------------------------------------------------------
// ----- GatewayError: Public --------------------------------------------------

impl GatewayError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, GatewayError::WouldBlock(_))
    }

    pub fn is_load_failure(&self) -> bool {
        matches!(self, GatewayError::LoadFailure(_))
    }

    /// Underlying library error code, when the failure carried one.
    pub fn code(&self) -> Option<u64> {
        match self {
            GatewayError::Transport { code, .. } => *code,
            _ => None,
        }
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        GatewayError::InvalidArgument { what: what.into() }
    }
}

impl From<GatewayError> for io::Error {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::WouldBlock(_) => io::Error::from(io::ErrorKind::WouldBlock),
            GatewayError::InvalidArgument { .. } => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            other => io::Error::other(other),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn fmt_code(code: &Option<u64>) -> String {
    match code {
        Some(code) => format!(" (code {code:#x})"),
        None => String::new(),
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
