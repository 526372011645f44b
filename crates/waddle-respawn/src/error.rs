//! Error types for listener inheritance and process respawn.

use thiserror::Error;

/// Errors returned by the listener factory, the process spawner and the
/// argv builder.
///
/// None of these conditions terminate the process. A failed spawn leaves
/// every live listener of the caller untouched.
#[derive(Debug, Error)]
pub enum RespawnError {
    /// Unknown network kind, or an address that does not parse for it.
    #[error("Invalid address {address:?} for network {network:?}: {reason}")]
    Address {
        network: String,
        address: String,
        reason: String,
    },

    /// The OS refused to bind or listen (address in use, permission, ...).
    #[error("Failed to bind {network} {address}: {source}")]
    Bind {
        network: String,
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// An inherited descriptor is absent, malformed or of the wrong kind.
    #[error("Inherited descriptor error: {0}")]
    Descriptor(String),

    /// The executable could not be resolved, a descriptor could not be
    /// duplicated, or process creation failed.
    #[error("Spawn failed ({context}): {source}")]
    Spawn {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A flag could not be rendered back into an argument.
    #[error("Cannot render flag {name:?}: {reason}")]
    Argument { name: String, reason: String },

    /// Generic OS failure (resource exhaustion and the like).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RespawnError {
    pub(crate) fn address(network: &str, address: &str, reason: impl Into<String>) -> Self {
        Self::Address {
            network: network.to_string(),
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn spawn(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            context: context.into(),
            source,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RespawnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RespawnError::address("tcp9", "x", "unknown network");
        assert_eq!(
            err.to_string(),
            "Invalid address \"x\" for network \"tcp9\": unknown network"
        );

        let err = RespawnError::spawn(
            "resolve /nope",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.to_string().starts_with("Spawn failed (resolve /nope)"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
