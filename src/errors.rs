use std::io;

/// Error kinds the rest of the crate matches on by type.
///
/// Everything still travels through `anyhow::Result`; these exist so callers
/// can downcast and decide between "retry the host", "fail the dispatch" and
/// "fail the whole invocation" without string sniffing.
#[derive(Debug, thiserror::Error)]
pub enum FtlError {
    #[error("{0}")]
    ModuleNotFound(String),

    #[error("invalid frame length prefix {prefix:?}, trailing bytes {trailing:?}")]
    Protocol { prefix: Vec<u8>, trailing: Vec<u8> },

    #[error("invalid frame payload: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("gate closed the stream unexpectedly")]
    GateEof,

    #[error("gate handshake failed: {0}")]
    Handshake(String),

    #[error("unsupported message type {0}")]
    UnsupportedMessage(String),
}

fn io_error_is_transport(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

/// Whether an error should drive the evict-and-retry loop rather than
/// surface as the host's result. Anything that means "the channel to this
/// host is gone" qualifies; logic errors never do.
pub fn is_transport_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<openssh::Error>() {
            match e {
                openssh::Error::Disconnected | openssh::Error::RemoteProcessTerminated => {
                    return true
                }
                openssh::Error::Master(io)
                | openssh::Error::Connect(io)
                | openssh::Error::Remote(io) => {
                    if io_error_is_transport(io) {
                        return true;
                    }
                }
                _ => {}
            }
        }
        if let Some(e) = cause.downcast_ref::<io::Error>() {
            if io_error_is_transport(e) {
                return true;
            }
        }
        if matches!(cause.downcast_ref::<FtlError>(), Some(FtlError::GateEof)) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connection_reset_is_transport() {
        let err = anyhow::Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(is_transport_error(&err));
    }

    #[test]
    fn gate_eof_is_transport() {
        let err = anyhow::Error::from(FtlError::GateEof);
        assert!(is_transport_error(&err));
    }

    #[test]
    fn module_not_found_is_not_transport() {
        let err = anyhow::Error::from(FtlError::ModuleNotFound("fact_gather".into()));
        assert!(!is_transport_error(&err));
    }

    #[test]
    fn wrapped_io_error_is_still_transport() {
        let io = anyhow::Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        let err = io.context("sending frame to gate");
        assert!(is_transport_error(&err));
    }
}
