//! Delivery errors and their transient/permanent classification.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Result type for delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Socket-level failure before or during the SMTP conversation
    #[error("network error ({kind:?}): {message}")]
    Network { kind: io::ErrorKind, message: String },

    /// Hostname resolution failure
    #[error("resolution error: {0}")]
    Resolve(String),

    /// SMTP reply with an error status code
    #[error("smtp error {code}: {message}")]
    Protocol { code: u16, message: String },

    /// The message itself could not be built (bad address, empty body)
    #[error("invalid message: {0}")]
    Message(String),

    /// Transport failure that fits none of the above
    #[error("transport error: {0}")]
    Transport(String),
}

const TRANSIENT_IO_KINDS: &[io::ErrorKind] = &[
    io::ErrorKind::ConnectionReset,
    io::ErrorKind::ConnectionRefused,
    io::ErrorKind::TimedOut,
    io::ErrorKind::ConnectionAborted,
    io::ErrorKind::BrokenPipe,
    io::ErrorKind::NotConnected,
];

impl DeliveryError {
    /// Whether this failure is worth retrying.
    ///
    /// Connection-level faults, resolution failures, and 4xx SMTP
    /// replies are transient; 5xx replies, bad messages, and anything
    /// unrecognized are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryError::Network { kind, .. } => TRANSIENT_IO_KINDS.contains(kind),
            DeliveryError::Resolve(_) => true,
            DeliveryError::Protocol { code, .. } => (400..500).contains(code),
            DeliveryError::Message(_) | DeliveryError::Transport(_) => false,
        }
    }
}

/// Walks a lettre error's source chain looking for the underlying
/// `io::Error`, which carries the kind used for classification.
fn io_kind_of(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(source) = current {
        if let Some(io_err) = source.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        current = source.source();
    }
    None
}

// DNS failures surface as uncategorized io errors whose kind cannot be
// matched, so resolution is recognized by the resolver's own wording.
const RESOLUTION_MARKERS: &[&str] = &[
    "lookup address",
    "name or service not known",
    "nodename nor servname",
    "dns error",
];

fn is_resolution_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(source) = current {
        let text = source.to_string().to_lowercase();
        if RESOLUTION_MARKERS.iter().any(|marker| text.contains(marker)) {
            return true;
        }
        current = source.source();
    }
    false
}

impl From<lettre::transport::smtp::Error> for DeliveryError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        if let Some(code) = err.status() {
            return DeliveryError::Protocol {
                code: code.to_string().parse().unwrap_or(0),
                message: err.to_string(),
            };
        }
        if is_resolution_failure(&err) {
            return DeliveryError::Resolve(err.to_string());
        }
        if let Some(kind) = io_kind_of(&err) {
            return DeliveryError::Network {
                kind,
                message: err.to_string(),
            };
        }
        DeliveryError::Transport(err.to_string())
    }
}

impl From<lettre::error::Error> for DeliveryError {
    fn from(err: lettre::error::Error) -> Self {
        DeliveryError::Message(err.to_string())
    }
}

impl From<lettre::address::AddressError> for DeliveryError {
    fn from(err: lettre::address::AddressError) -> Self {
        DeliveryError::Message(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(kind: io::ErrorKind) -> DeliveryError {
        DeliveryError::Network {
            kind,
            message: "boom".to_string(),
        }
    }

    fn protocol(code: u16) -> DeliveryError {
        DeliveryError::Protocol {
            code,
            message: "smtp said no".to_string(),
        }
    }

    #[test]
    fn connection_faults_are_transient() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected,
        ] {
            assert!(network(kind).is_transient(), "{kind:?} should be transient");
        }
    }

    #[test]
    fn other_io_kinds_are_permanent() {
        assert!(!network(io::ErrorKind::PermissionDenied).is_transient());
        assert!(!network(io::ErrorKind::InvalidData).is_transient());
        // Local not-found has nothing to do with name resolution.
        assert!(!network(io::ErrorKind::NotFound).is_transient());
    }

    #[test]
    fn resolution_failures_are_transient() {
        assert!(DeliveryError::Resolve("no such host".to_string()).is_transient());
    }

    #[test]
    fn resolution_wording_is_found_through_a_source_chain() {
        #[derive(Debug)]
        struct Outer(io::Error);
        impl std::fmt::Display for Outer {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "Connection error")
            }
        }
        impl StdError for Outer {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }

        let dns = Outer(io::Error::other(
            "failed to lookup address information: Name or service not known",
        ));
        assert!(is_resolution_failure(&dns));

        let refused = Outer(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(!is_resolution_failure(&refused));
    }

    #[test]
    fn four_xx_is_transient_five_xx_is_permanent() {
        assert!(protocol(421).is_transient());
        assert!(protocol(450).is_transient());
        assert!(protocol(499).is_transient());
        assert!(!protocol(500).is_transient());
        assert!(!protocol(550).is_transient());
        assert!(!protocol(399).is_transient());
    }

    #[test]
    fn message_and_transport_errors_are_permanent() {
        assert!(!DeliveryError::Message("empty body".to_string()).is_transient());
        assert!(!DeliveryError::Transport("tls setup".to_string()).is_transient());
    }

    #[test]
    fn io_kind_is_found_through_a_source_chain() {
        #[derive(Debug)]
        struct Outer(io::Error);
        impl std::fmt::Display for Outer {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "outer")
            }
        }
        impl StdError for Outer {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }

        let outer = Outer(io::Error::new(io::ErrorKind::TimedOut, "late"));
        assert_eq!(io_kind_of(&outer), Some(io::ErrorKind::TimedOut));
    }
}
