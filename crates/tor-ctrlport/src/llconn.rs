//! Lowest-level API interface to an active control-port connection.
//!
//! Wraps the two directions of the byte stream, applying the wire codec to
//! each: whole [`Reply`] messages come out of the [`Reader`], formatted
//! commands go into the [`Writer`].

use std::io;

use tracing::{info, trace};

use crate::msgs::codec;
use crate::msgs::reply::Reply;
use crate::{Error, Result};

/// A low-level reader type, wrapping a boxed [`BufRead`](io::BufRead).
pub(crate) struct Reader {
    /// The underlying reader.
    backend: Box<dyn io::BufRead + Send>,
}

/// A low-level writer type, wrapping a boxed [`Write`](io::Write).
pub(crate) struct Writer {
    /// The underlying writer.
    backend: Box<dyn io::Write + Send>,
}

impl Reader {
    /// Create a new Reader, wrapping an [`io::BufRead`].
    pub(crate) fn new<T>(backend: T) -> Self
    where
        T: io::BufRead + Send + 'static,
    {
        Self {
            backend: Box::new(backend),
        }
    }

    /// Receive one inbound reply, blocking as needed until it is complete.
    pub(crate) fn read_reply(&mut self) -> Result<Reply> {
        codec::read_reply(&mut self.backend)
    }
}

impl Writer {
    /// Create a new writer, wrapping an [`io::Write`].
    pub(crate) fn new<T>(backend: T) -> Self
    where
        T: io::Write + Send + 'static,
    {
        Self {
            backend: Box::new(backend),
        }
    }

    /// Format `message` as a command and send it, flushing the stream.
    ///
    /// With `raw` set, the message bytes are passed through untouched; the
    /// caller is then responsible for the framing.
    pub(crate) fn send_command(&mut self, message: &str, raw: bool) -> Result<()> {
        let formatted = if raw {
            message.to_owned()
        } else {
            codec::format_command(message)
        };

        let outcome = self
            .backend
            .write_all(formatted.as_bytes())
            .and_then(|()| self.backend.flush());
        match outcome {
            Ok(()) => {
                trace!("Sent to tor:\n{}", formatted.replace("\r\n", "\n").trim_end());
                Ok(())
            }
            Err(e) => {
                info!("Failed to send message: {e}");
                Err(Error::from_io(e))
            }
        }
    }
}
