use thiserror::Error;

/// Errors produced anywhere in the relay.
///
/// Every variant maps onto an [`ErrorKind`], and every kind onto exactly one
/// [`Disposition`]. Loops consult [`RelayError::disposition`] instead of
/// deciding per call site whether to retry, drop, or give up.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("malformed envelope: {0}")]
    Parse(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("downstream error: {0}")]
    Downstream(String),

    #[error("session replaced by a newer connection")]
    Evicted,

    #[error("timeout")]
    Timeout,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Protocol(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Coarse error classification used by the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Auth,
    Integrity,
    Parse,
    Protocol,
    Downstream,
    Evicted,
    Timeout,
    Config,
    Io,
}

/// What a loop does when it meets an error of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back off and try again (reconnect, resend).
    Retry,
    /// Log, skip the offending item, keep the loop running.
    Drop,
    /// Stop for good. Never retried.
    Fatal,
}

impl ErrorKind {
    /// The policy table.
    pub const fn disposition(self) -> Disposition {
        match self {
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::Io => Disposition::Retry,
            ErrorKind::Auth | ErrorKind::Evicted | ErrorKind::Config => Disposition::Fatal,
            ErrorKind::Integrity
            | ErrorKind::Parse
            | ErrorKind::Protocol
            | ErrorKind::Downstream => Disposition::Drop,
        }
    }
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Transport(_) => ErrorKind::Transport,
            RelayError::Auth(_) => ErrorKind::Auth,
            RelayError::Integrity(_) => ErrorKind::Integrity,
            RelayError::Parse(_) => ErrorKind::Parse,
            RelayError::Protocol(_) => ErrorKind::Protocol,
            RelayError::Downstream(_) => ErrorKind::Downstream,
            RelayError::Evicted => ErrorKind::Evicted,
            RelayError::Timeout => ErrorKind::Timeout,
            RelayError::Config(_) => ErrorKind::Config,
            RelayError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn disposition(&self) -> Disposition {
        self.kind().disposition()
    }

    pub fn is_fatal(&self) -> bool {
        self.disposition() == Disposition::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_retried() {
        assert_eq!(
            RelayError::Transport("reset".into()).disposition(),
            Disposition::Retry
        );
        assert_eq!(RelayError::Timeout.disposition(), Disposition::Retry);
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(RelayError::from(io).disposition(), Disposition::Retry);
    }

    #[test]
    fn auth_and_eviction_are_fatal() {
        assert!(RelayError::Auth("invalid token".into()).is_fatal());
        assert!(RelayError::Evicted.is_fatal());
        assert!(RelayError::Config("bad key".into()).is_fatal());
    }

    #[test]
    fn bad_input_is_dropped() {
        for err in [
            RelayError::Integrity("signature mismatch".into()),
            RelayError::Parse("missing Encrypt".into()),
            RelayError::Protocol("unknown frame".into()),
            RelayError::Downstream("agent crashed".into()),
        ] {
            assert_eq!(err.disposition(), Disposition::Drop, "{err}");
        }
    }

    #[test]
    fn json_errors_are_protocol_errors() {
        let err: RelayError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
