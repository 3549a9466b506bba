use thiserror::Error;

/// The runtime error taxonomy.
///
/// Every variant renders to the stable error name scripts match on; the
/// `Display` form is exactly the string a fiber receives in the second
/// slot of a `(nil, err)` resume.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CoreError {
    // Protocol misuse
    #[error("NOT_IN_FIBER")]
    NotInFiber,
    #[error("ANOTHER_IN_PROGRESS")]
    AnotherInProgress,
    #[error("INVALID_HANDLE")]
    InvalidHandle,
    #[error("BAD_PARAM: {0}")]
    BadParam(String),
    #[error("BAD_SCHEME: {0}")]
    BadScheme(String),
    #[error("PATH_TOO_LONG")]
    PathTooLong,
    #[error("NONLOOPBACK_FORBIDDEN: {0}")]
    NonLoopbackForbidden(String),

    // Transport
    #[error("BIND_FAILED: {0}")]
    BindFailed(String),
    #[error("LISTEN_FAILED: {0}")]
    ListenFailed(String),
    #[error("ACCEPT_FAILED: {0}")]
    AcceptFailed(String),
    #[error("CONNECT_FAILED: {0}")]
    ConnectFailed(String),
    #[error("READ_FAILED: {0}")]
    ReadFailed(String),
    #[error("WRITE_FAILED: {0}")]
    WriteFailed(String),
    #[error("SEND_FAILED: {0}")]
    SendFailed(String),
    #[error("RECV_FAILED: {0}")]
    RecvFailed(String),
    #[error("SIGNAL_FAILED: {0}")]
    SignalFailed(String),

    // Resource
    #[error("OUT_OF_MEMORY")]
    OutOfMemory,
    #[error("LIMIT_EXCEEDED:{0}")]
    LimitExceeded(&'static str),
    #[error("FS_FAILED: {0}")]
    FsFailed(String),

    // Lifecycle
    #[error("CONN_CLOSED")]
    ConnClosed,
    #[error("CANCELLED")]
    Cancelled,
}

impl CoreError {
    /// The two-slot `(nil, err)` resume payload for a failed primitive.
    pub fn into_result(self) -> Vec<crate::value::Value> {
        vec![
            crate::value::Value::Nil,
            crate::value::Value::Str(self.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable() {
        assert_eq!(CoreError::NotInFiber.to_string(), "NOT_IN_FIBER");
        assert_eq!(
            CoreError::LimitExceeded("max_body_bytes").to_string(),
            "LIMIT_EXCEEDED:max_body_bytes"
        );
        assert_eq!(CoreError::Cancelled.to_string(), "CANCELLED");
    }
}
