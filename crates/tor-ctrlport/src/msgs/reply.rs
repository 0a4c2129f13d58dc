//! The parsed form of a control-port reply.
//!
//! A reply is an ordered, immutable sequence of status-coded lines; the
//! same shape carries both answers to commands and asynchronous events.
//! [`ControlLine`] provides the tokenization that typed converters use to
//! pick replies apart.

use std::fmt;

/// The character after the status code, which tells us how a reply line
/// relates to the lines around it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::Display)]
#[allow(clippy::exhaustive_enums)]
pub enum Divider {
    /// `-`: a line in the middle of a reply; more lines follow.
    #[display("-")]
    Mid,
    /// ` `: the final line of a reply.
    #[display(" ")]
    End,
    /// `+`: the first line of a data block; the block's remaining lines are
    /// folded into this line's content, separated by `\n`.
    #[display("+")]
    Data,
}

impl Divider {
    /// Interpret `b` as a divider, if it is one.
    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'-' => Some(Divider::Mid),
            b' ' => Some(Divider::End),
            b'+' => Some(Divider::Data),
            _ => None,
        }
    }
}

/// A single line of a [`Reply`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplyLine {
    /// The three-character status code, as it appeared on the wire.
    code: String,
    /// How this line relates to the rest of the reply.
    divider: Divider,
    /// The line's content, without its status code, divider, or CRLF.
    ///
    /// For a [`Divider::Data`] line this includes the whole (un-stuffed)
    /// data block, `\n`-separated.
    content: String,
}

impl ReplyLine {
    /// Construct a new ReplyLine.
    pub(crate) fn new(code: String, divider: Divider, content: String) -> Self {
        debug_assert_eq!(code.len(), 3);
        Self {
            code,
            divider,
            content,
        }
    }

    /// Return this line's three-character status code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Return this line's divider.
    pub fn divider(&self) -> Divider {
        self.divider
    }

    /// Return this line's content.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Return a tokenizer over this line's content.
    pub fn tokens(&self) -> ControlLine<'_> {
        ControlLine::new(&self.content)
    }
}

/// A complete message from tor: either the response to a command, or an
/// asynchronous event.
///
/// Invariants: a reply is never empty; its final line has [`Divider::End`];
/// every earlier line has [`Divider::Mid`] or [`Divider::Data`].  Replies
/// are immutable once parsed, so they can be shared freely.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    /// The lines of this reply, in wire order.
    lines: Vec<ReplyLine>,
}

impl Reply {
    /// Construct a Reply from already-parsed lines.
    ///
    /// The caller (the codec) is responsible for the framing invariants.
    pub(crate) fn from_lines(lines: Vec<ReplyLine>) -> Self {
        debug_assert!(!lines.is_empty());
        debug_assert_eq!(
            lines.last().map(ReplyLine::divider),
            Some(Divider::End),
            "reply must end with an End line"
        );
        Self { lines }
    }

    /// Return the lines of this reply, in wire order.
    pub fn lines(&self) -> &[ReplyLine] {
        &self.lines
    }

    /// Return the status code of this reply's final line.
    pub fn code(&self) -> &str {
        self.last().code()
    }

    /// Return the content of this reply's final line.
    pub fn message(&self) -> &str {
        self.last().content()
    }

    /// Return this reply's final line.
    fn last(&self) -> &ReplyLine {
        self.lines.last().expect("empty reply")
    }

    /// Return true if every line of this reply carries status code `250`.
    pub fn is_ok(&self) -> bool {
        self.lines.iter().all(|line| line.code() == "250")
    }

    /// Return true if this reply is an asynchronous event.
    ///
    /// Events never arrive in response to a command; the transport routes
    /// them to its event handler instead of to a waiting request.
    pub fn is_event(&self) -> bool {
        self.code() == "650"
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for line in &self.lines {
            if !first {
                writeln!(f)?;
            }
            write!(f, "{}", line.content())?;
            first = false;
        }
        Ok(())
    }
}

/// A cursor over the space-separated tokens of a reply line's content.
///
/// Replies mix positional tokens (`EXTENDED 7`) with `KEY=VALUE` mappings
/// whose values are sometimes quoted.  This type consumes a line from left
/// to right; popping a token advances past it and its separating space.
#[derive(Clone, Debug)]
pub struct ControlLine<'a> {
    /// The not-yet-consumed portion of the line.
    remainder: &'a str,
}

impl<'a> ControlLine<'a> {
    /// Construct a tokenizer over `content`.
    pub fn new(content: &'a str) -> Self {
        Self { remainder: content }
    }

    /// Return whatever has not been consumed yet.
    pub fn remainder(&self) -> &'a str {
        self.remainder
    }

    /// Return true if the whole line has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remainder.is_empty()
    }

    /// Return the next space-separated token, consuming it.
    ///
    /// Returns `None` once the line is exhausted.
    pub fn pop(&mut self) -> Option<&'a str> {
        if self.remainder.is_empty() {
            return None;
        }
        match self.remainder.split_once(' ') {
            Some((token, rest)) => {
                self.remainder = rest;
                Some(token)
            }
            None => {
                let token = self.remainder;
                self.remainder = "";
                Some(token)
            }
        }
    }

    /// Return the next token, which must be surrounded by double quotes,
    /// consuming it.  The quotes are not included in the result.
    ///
    /// Returns `None` if the next token is not quoted, or if its closing
    /// quote is missing.
    pub fn pop_quoted(&mut self) -> Option<&'a str> {
        let rest = self.remainder.strip_prefix('"')?;
        let (value, after) = rest.split_once('"')?;
        self.remainder = after.strip_prefix(' ').unwrap_or(after);
        Some(value)
    }

    /// Return true if the next token is a `KEY=VALUE` mapping.
    ///
    /// If `key` is given, the mapping's key must match it exactly; if
    /// `quoted` is true, the value must be quoted.
    pub fn is_next_mapping(&self, key: Option<&str>, quoted: bool) -> bool {
        let Some((found_key, rest)) = split_mapping(self.remainder) else {
            return false;
        };
        if let Some(key) = key {
            if found_key != key {
                return false;
            }
        }
        !quoted || rest.starts_with('"')
    }

    /// Pop a `KEY=VALUE` mapping, returning the key and value.
    ///
    /// If `quoted` is true the value must be quoted, and is returned with
    /// its quotes removed; otherwise the value runs to the next space.
    /// Returns `None` if the next token is not a well-formed mapping.
    pub fn pop_mapping(&mut self, quoted: bool) -> Option<(&'a str, &'a str)> {
        let (key, rest) = split_mapping(self.remainder)?;
        let mut value_cursor = ControlLine { remainder: rest };
        let value = if quoted {
            value_cursor.pop_quoted()?
        } else {
            value_cursor.pop().unwrap_or("")
        };
        self.remainder = value_cursor.remainder;
        Some((key, value))
    }
}

/// Split `s` into a mapping key and everything after the `=`, if `s`
/// begins with a well-formed mapping key.
fn split_mapping(s: &str) -> Option<(&str, &str)> {
    let (key, rest) = s.split_once('=')?;
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    Some((key, rest))
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

    /// Shorthand for building a single-line reply in tests.
    fn one_line(code: &str, content: &str) -> Reply {
        Reply::from_lines(vec![ReplyLine::new(
            code.into(),
            Divider::End,
            content.into(),
        )])
    }

    #[test]
    fn reply_accessors() {
        let reply = Reply::from_lines(vec![
            ReplyLine::new("250".into(), Divider::Mid, "version=0.2.3.24-rc".into()),
            ReplyLine::new("250".into(), Divider::End, "OK".into()),
        ]);
        assert_eq!(reply.code(), "250");
        assert_eq!(reply.message(), "OK");
        assert!(reply.is_ok());
        assert!(!reply.is_event());
        assert_eq!(reply.to_string(), "version=0.2.3.24-rc\nOK");
    }

    #[test]
    fn mixed_codes_are_not_ok() {
        let reply = Reply::from_lines(vec![
            ReplyLine::new("250".into(), Divider::Mid, "meh".into()),
            ReplyLine::new("552".into(), Divider::End, "no such thing".into()),
        ]);
        assert!(!reply.is_ok());
        assert_eq!(reply.code(), "552");
    }

    #[test]
    fn event_detection() {
        assert!(one_line("650", "CIRC 7 BUILT").is_event());
        assert!(!one_line("250", "OK").is_event());
    }

    #[test]
    fn pop_tokens() {
        let mut line = ControlLine::new("EXTENDED 7 more");
        assert_eq!(line.pop(), Some("EXTENDED"));
        assert_eq!(line.pop(), Some("7"));
        assert!(!line.is_empty());
        assert_eq!(line.pop(), Some("more"));
        assert_eq!(line.pop(), None);
        assert!(line.is_empty());
    }

    #[test]
    fn pop_quoted() {
        let mut line = ControlLine::new("\"80 127.0.0.1:80\" rest");
        assert_eq!(line.pop_quoted(), Some("80 127.0.0.1:80"));
        assert_eq!(line.remainder(), "rest");

        let mut unterminated = ControlLine::new("\"no closing quote");
        assert_eq!(unterminated.pop_quoted(), None);

        let mut unquoted = ControlLine::new("bare");
        assert_eq!(unquoted.pop_quoted(), None);
    }

    #[test]
    fn mappings() {
        let mut line = ControlLine::new("SERVERHASH=0a0b SERVERNONCE=0c0d");
        assert!(line.is_next_mapping(Some("SERVERHASH"), false));
        assert!(!line.is_next_mapping(Some("SERVERNONCE"), false));
        assert_eq!(line.pop_mapping(false), Some(("SERVERHASH", "0a0b")));
        assert_eq!(line.pop_mapping(false), Some(("SERVERNONCE", "0c0d")));
        assert_eq!(line.pop_mapping(false), None);
    }

    #[test]
    fn quoted_mappings() {
        let mut line = ControlLine::new("ExitPolicy=\"accept *:80\" tail");
        assert!(line.is_next_mapping(None, true));
        assert_eq!(line.pop_mapping(true), Some(("ExitPolicy", "accept *:80")));
        assert_eq!(line.remainder(), "tail");

        // A bare value does not satisfy a request for a quoted one.
        let mut bare = ControlLine::new("DirPort=9030");
        assert!(!bare.is_next_mapping(None, true));
        assert_eq!(bare.pop_mapping(true), None);
    }

    #[test]
    fn mapping_rejects_spaced_keys() {
        let line = ControlLine::new("not akey=value");
        assert!(!line.is_next_mapping(None, false));
    }
}
