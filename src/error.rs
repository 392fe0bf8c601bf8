use std::{error, fmt, io};

/// A type alias for `Result<T, courier::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the gateway core.
///
/// Protocol errors close the offending socket; capacity errors drop the
/// offending frame and leave the connection alone. Transport errors are
/// surfaced as `Io`.
#[derive(Debug)]
pub enum Error {
    /// The peer never completed the auth exchange.
    Handshake,

    /// A request carried an operation that is not valid in its state.
    Operation(i32),

    /// Frame pack length out of bounds, or a truncated message.
    PackLen,

    /// Frame header length field did not match the fixed header size.
    HeaderLen,

    /// The client-request ring has no pending frame.
    RingEmpty,

    /// The client-request ring has no free slot.
    RingFull,

    /// The signal mailbox was full; the frame was dropped.
    SignalFullMsgDropped,

    /// The signal mailbox receiver is gone.
    SignalClosed,

    /// The room no longer accepts members.
    RoomDropped,

    /// A push or broadcast command carried invalid arguments.
    BroadcastArg,

    /// The logic interface rejected the call.
    Logic(String),

    /// Invalid configuration file.
    Config(String),

    /// An I/O error from the transport.
    Io(io::Error),
}

// ===== impl Error =====

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Handshake => write!(fmt, "handshake failed"),
            Error::Operation(op) => write!(fmt, "request operation not valid: {}", op),
            Error::PackLen => write!(fmt, "codec pack length error"),
            Error::HeaderLen => write!(fmt, "codec header length error"),
            Error::RingEmpty => write!(fmt, "ring buffer empty"),
            Error::RingFull => write!(fmt, "ring buffer full"),
            Error::SignalFullMsgDropped => write!(fmt, "signal channel full, msg dropped"),
            Error::SignalClosed => write!(fmt, "signal channel closed"),
            Error::RoomDropped => write!(fmt, "room dropped"),
            Error::BroadcastArg => write!(fmt, "broadcast arg error"),
            Error::Logic(ref msg) => write!(fmt, "logic call failed: {}", msg),
            Error::Config(ref msg) => write!(fmt, "config error: {}", msg),
            Error::Io(ref err) => write!(fmt, "io error: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Io(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(src: io::Error) -> Error {
        Error::Io(src)
    }
}

impl Error {
    /// Whether this error is the routine end of a connection rather
    /// than something worth an error-level log line.
    pub fn is_expected_close(&self) -> bool {
        match *self {
            Error::Io(ref err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expected_close_classification() {
        let eof = Error::from(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(eof.is_expected_close());

        let denied = Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert!(!denied.is_expected_close());

        assert!(!Error::Handshake.is_expected_close());
    }
}
