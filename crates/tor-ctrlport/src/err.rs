//! Declare an error type for the `tor-ctrlport` crate.

use std::io;
use std::sync::Arc;

/// A shorthand for the `Result` type returned throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that has occurred while speaking the control protocol.
///
/// Several variants correspond to status codes that tor reports in its
/// replies; those carry the code as the three wire bytes, unparsed.
///
/// The original controller taxonomy arranges these as a hierarchy
/// (`InvalidArguments` is a kind of `InvalidRequest`, which is a kind of
/// `OperationFailed`; `SocketClosed` is a kind of socket error).  Here the
/// hierarchy is flattened into one enum; use [`Error::is_operation_failed`]
/// and [`Error::is_socket_error`] to match a whole family at once.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed content from the control socket.
    ///
    /// This is a protocol violation: either the framing was invalid, or a
    /// reply was missing something that every reply of its kind must have.
    #[error("Malformed control message: {0}")]
    Protocol(String),

    /// Tor was unable to complete a valid request.
    #[error("Operation failed (status {code}): {message}")]
    OperationFailed {
        /// Status code returned by tor.
        code: String,
        /// Error message returned by tor.
        message: String,
    },

    /// Tor was unable to satisfy a request that can never succeed.
    #[error("Request cannot be satisfied (status {code}): {message}")]
    UnsatisfiableRequest {
        /// Status code returned by tor.
        code: String,
        /// Error message returned by tor.
        message: String,
    },

    /// Tor rejected the request as invalid or malformed.
    #[error("Invalid request (status {code}): {message}")]
    InvalidRequest {
        /// Status code returned by tor.
        code: String,
        /// Error message returned by tor.
        message: String,
    },

    /// Tor rejected one or more named keys, options, or features.
    #[error("Invalid arguments {arguments:?} (status {code}): {message}")]
    InvalidArguments {
        /// Status code returned by tor.
        code: String,
        /// Error message returned by tor.
        message: String,
        /// The offending names, as extracted from tor's error message.
        arguments: Vec<String>,
    },

    /// A problem arose while using the control socket.
    #[error("Control socket IO failed: {0}")]
    Socket(Arc<io::Error>),

    /// The control socket was closed before the exchange completed.
    #[error("Control socket is closed")]
    SocketClosed,
}

impl Error {
    /// Return true if this error means that tor turned down a request.
    ///
    /// This covers [`OperationFailed`](Error::OperationFailed) and all of
    /// its more specific refinements.
    pub fn is_operation_failed(&self) -> bool {
        matches!(
            self,
            Error::OperationFailed { .. }
                | Error::UnsatisfiableRequest { .. }
                | Error::InvalidRequest { .. }
                | Error::InvalidArguments { .. }
        )
    }

    /// Return true if this error arose from the socket itself, including
    /// the socket having been closed.
    pub fn is_socket_error(&self) -> bool {
        matches!(self, Error::Socket(_) | Error::SocketClosed)
    }

    /// Classify `e`, distinguishing errors that mean "the peer is gone"
    /// from other IO failures.
    ///
    /// There is no single error kind for a disconnected stream socket:
    /// reads on a torn-down connection surface as any of the kinds below
    /// depending on platform and timing.
    pub(crate) fn from_io(e: io::Error) -> Self {
        use io::ErrorKind as K;
        match e.kind() {
            K::NotConnected
            | K::BrokenPipe
            | K::ConnectionReset
            | K::ConnectionAborted
            | K::UnexpectedEof => Error::SocketClosed,
            _ => Error::Socket(Arc::new(e)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Socket(Arc::new(e))
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;

    #[test]
    fn families() {
        let e = Error::InvalidArguments {
            code: "552".into(),
            message: "Unrecognized option".into(),
            arguments: vec!["NotAnOption".into()],
        };
        assert!(e.is_operation_failed());
        assert!(!e.is_socket_error());

        assert!(Error::SocketClosed.is_socket_error());
        assert!(!Error::Protocol("nope".into()).is_operation_failed());
    }

    #[test]
    fn io_classification() {
        let gone = Error::from_io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(gone, Error::SocketClosed));

        let other = Error::from_io(io::Error::other("wat"));
        assert!(matches!(other, Error::Socket(_)));
    }
}
