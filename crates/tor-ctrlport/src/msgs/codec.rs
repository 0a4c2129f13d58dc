//! Wire framing for the control protocol.
//!
//! Encoding and decoding are pure functions over byte streams: the
//! transport decides *when* to read and write, this module decides *what*
//! the bytes mean.  See section 2 of tor's control-spec for the grammar.

use std::io::BufRead;

use tracing::trace;

use crate::msgs::reply::{Divider, Reply, ReplyLine};
use crate::{Error, Result};

/// Format `message` the way the control port expects commands.
///
/// A single-line command is terminated with CRLF.  A command with embedded
/// newlines is sent in the multi-line form: a leading `+`, CRLF line
/// endings, and a terminating `.` line:
///
/// ```text
/// +LOADCONF\r\n
/// SocksPort 9050\r\n
/// .\r\n
/// ```
pub(crate) fn format_command(message: &str) -> String {
    // Standardize on LF first, so a caller who already uses CRLF does not
    // end up with doubled carriage returns.
    let message = message.replace("\r\n", "\n");

    if message.contains('\n') {
        format!("+{}\r\n.\r\n", message.replace('\n', "\r\n"))
    } else {
        format!("{message}\r\n")
    }
}

/// Read one complete reply from `stream`, blocking until it arrives.
///
/// Errors are distinguished as follows: malformed framing is
/// [`Error::Protocol`]; a stream that ends (or reports a
/// disconnection-flavored IO error) is [`Error::SocketClosed`]; any other
/// IO failure is [`Error::Socket`].
pub(crate) fn read_reply<R: BufRead + ?Sized>(stream: &mut R) -> Result<Reply> {
    let mut lines: Vec<ReplyLine> = Vec::new();
    let mut raw_content = String::new();

    loop {
        let line = read_wire_line(stream)?;
        raw_content.push_str(&line);

        // Reply lines have the form <status code><divider><content>\r\n.
        if line.len() < 4 {
            return Err(Error::Protocol(
                "Badly formatted reply line: too short".into(),
            ));
        }
        let bytes = line.as_bytes();
        let divider = Divider::from_byte(bytes[3]);
        if !bytes[..3].iter().all(u8::is_ascii_alphanumeric) || divider.is_none() {
            return Err(Error::Protocol(
                "Badly formatted reply line: beginning is malformed".into(),
            ));
        }
        let Some(line) = line.strip_suffix("\r\n") else {
            return Err(Error::Protocol("All lines should end with CRLF".into()));
        };
        let divider = divider.expect("divider vanished");

        let code = line[..3].to_owned();
        let mut content = line[4..].to_owned();

        match divider {
            Divider::Mid => {
                lines.push(ReplyLine::new(code, divider, content));
            }
            Divider::End => {
                lines.push(ReplyLine::new(code, divider, content));
                trace!(
                    "Received from tor:\n{}",
                    raw_content.replace("\r\n", "\n").trim_end()
                );
                return Ok(Reply::from_lines(lines));
            }
            Divider::Data => {
                // Everything until a lone `.` belongs to this line.
                loop {
                    let data_line = read_wire_line(stream)?;
                    raw_content.push_str(&data_line);

                    let Some(data_line) = data_line.strip_suffix("\r\n") else {
                        return Err(Error::Protocol("All lines should end with CRLF".into()));
                    };
                    if data_line == "." {
                        break;
                    }

                    // Lines starting with a period are escaped by a second
                    // period (control-spec section 2.4).
                    let data_line = if data_line.starts_with("..") {
                        &data_line[1..]
                    } else {
                        data_line
                    };

                    content.push('\n');
                    content.push_str(data_line);
                }
                lines.push(ReplyLine::new(code, divider, content));
            }
        }
    }
}

/// Read one CRLF-terminated line from `stream`, returning it with its
/// terminator still attached.
///
/// A zero-byte read means the peer has disconnected, which is reported as
/// [`Error::SocketClosed`] no matter where in a reply it happens.
fn read_wire_line<R: BufRead + ?Sized>(stream: &mut R) -> Result<String> {
    let mut buf = Vec::new();
    match stream.read_until(b'\n', &mut buf) {
        Ok(0) => Err(Error::SocketClosed),
        Ok(_) => String::from_utf8(buf)
            .map_err(|_| Error::Protocol("Reply line is not valid UTF-8".into())),
        Err(e) => Err(Error::from_io(e)),
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

    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    /// Parse a reply out of a byte literal.
    fn parse(input: &str) -> Result<Reply> {
        read_reply(&mut Cursor::new(input))
    }

    #[test]
    fn format_single_line() {
        assert_eq!(format_command("GETINFO version"), "GETINFO version\r\n");
    }

    #[test]
    fn format_multi_line() {
        assert_eq!(
            format_command("LOADCONF\nSocksPort 9050"),
            "+LOADCONF\r\nSocksPort 9050\r\n.\r\n"
        );
        // CRLF input normalizes to the same bytes as LF input.
        assert_eq!(
            format_command("LOADCONF\r\nSocksPort 9050"),
            "+LOADCONF\r\nSocksPort 9050\r\n.\r\n"
        );
    }

    #[test]
    fn single_line_reply() {
        let reply = parse("250 OK\r\n").unwrap();
        assert_eq!(reply.lines().len(), 1);
        assert_eq!(reply.code(), "250");
        assert_eq!(reply.message(), "OK");
        assert!(reply.is_ok());
    }

    #[test]
    fn multi_line_reply() {
        let reply = parse("250-version=0.2.3.24-rc\r\n250 OK\r\n").unwrap();
        assert_eq!(reply.lines().len(), 2);
        assert_eq!(reply.lines()[0].content(), "version=0.2.3.24-rc");
        assert_eq!(reply.lines()[0].divider(), Divider::Mid);
        assert!(reply.is_ok());
    }

    #[test]
    fn data_block() {
        let reply = parse("250+config/names=\r\nBridge LineList\r\n..dotted\r\n.\r\n250 OK\r\n")
            .unwrap();
        assert_eq!(reply.lines().len(), 2);
        let data = &reply.lines()[0];
        assert_eq!(data.divider(), Divider::Data);
        // Data lines are joined with LF, and `..` decodes to one dot.
        assert_eq!(data.content(), "config/names=\nBridge LineList\n.dotted");
    }

    #[test]
    fn event_reply() {
        let reply = parse("650 CIRC 7 BUILT\r\n").unwrap();
        assert!(reply.is_event());
        assert!(!reply.is_ok());
    }

    #[test]
    fn too_short() {
        assert_matches!(parse(".\r\n"), Err(Error::Protocol(_)));
    }

    #[test]
    fn malformed_beginning() {
        // Bad divider.
        assert_matches!(parse("250*OK\r\n"), Err(Error::Protocol(_)));
        // Non-alphanumeric status code.
        assert_matches!(parse("2 0 OK\r\n"), Err(Error::Protocol(_)));
    }

    #[test]
    fn missing_crlf() {
        // LF alone is not a line terminator here.
        assert_matches!(parse("250 OK\n"), Err(Error::Protocol(_)));
        // Truncated final line.
        assert_matches!(parse("250 OK"), Err(Error::Protocol(_)));
    }

    #[test]
    fn eof_is_socket_closed() {
        assert_matches!(parse(""), Err(Error::SocketClosed));
        // Disconnection after a mid-reply line.
        assert_matches!(parse("250-version=1\r\n"), Err(Error::SocketClosed));
    }

    #[test]
    fn eof_inside_data_block() {
        assert_matches!(
            parse("250+config/names=\r\npartial\r\n"),
            Err(Error::SocketClosed)
        );
    }

    #[test]
    fn data_block_line_without_crlf() {
        assert_matches!(
            parse("250+config/names=\r\npartial"),
            Err(Error::Protocol(_))
        );
    }
}
