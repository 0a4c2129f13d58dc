//! Typed views of the replies tor sends for particular commands.
//!
//! The transport hands back generic [`Reply`] values; each type here
//! interprets one response shape, validating it in the process.  All of
//! them implement `TryFrom<&Reply>`, and all of them fail with
//! [`Error::Protocol`] when a reply does not have the shape its command
//! promises.
//!
//! Error *status codes* are interpreted here too, because several of them
//! can only be understood with the response kind in hand (a `552` from
//! GETCONF names an unrecognized configuration key; a `552` from
//! MAPADDRESS does not exist, but `512` does).

use std::collections::BTreeMap;

use crate::msgs::reply::Reply;
use crate::{Error, Result};

/// A response that is expected to be a single status line, such as the
/// replies to `SETCONF`, `SIGNAL`, or `EXTENDCIRCUIT`.
#[derive(Clone, Debug)]
pub struct SingleLine {
    /// The status code of the line.
    code: String,
    /// The content of the line.
    message: String,
}

impl SingleLine {
    /// Return the status code of this response.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Return the message of this response.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Return true if this response reports success.
    pub fn is_ok(&self) -> bool {
        self.code == "250"
    }
}

impl TryFrom<&Reply> for SingleLine {
    type Error = Error;

    fn try_from(reply: &Reply) -> Result<Self> {
        match reply.lines() {
            [line] => Ok(SingleLine {
                code: line.code().to_owned(),
                message: line.content().to_owned(),
            }),
            _ => Err(Error::Protocol(format!(
                "Received multiline response:\n{reply}"
            ))),
        }
    }
}

/// The parsed form of a `GETINFO` reply: a map from queried key to value.
///
/// Data-block values (for keys like `config/names`) appear under their key
/// with the block's lines joined by `\n`.
#[derive(Clone, Debug)]
pub struct GetInfoResponse {
    /// The key-to-value entries of the reply.
    entries: BTreeMap<String, String>,
}

impl GetInfoResponse {
    /// Return the entries of this reply.
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Consume this response, returning its entries.
    pub fn into_entries(self) -> BTreeMap<String, String> {
        self.entries
    }

    /// Check that this reply answered every one of `requested`.
    ///
    /// Tor answers `GETINFO` with one entry per requested key; a reply
    /// that omits one is malformed.
    pub fn assert_matches<'a, I>(&self, requested: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for key in requested {
            if !self.entries.contains_key(key) {
                return Err(Error::Protocol(format!(
                    "GETINFO reply doesn't contain a response for '{key}'"
                )));
            }
        }
        Ok(())
    }
}

impl TryFrom<&Reply> for GetInfoResponse {
    type Error = Error;

    fn try_from(reply: &Reply) -> Result<Self> {
        if !reply.is_ok() || reply.message() != "OK" {
            let unrecognized = collect_quoted_suffixes(reply, "552", "Unrecognized key \"");
            if !unrecognized.is_empty() {
                return Err(Error::InvalidArguments {
                    code: "552".into(),
                    message: format!(
                        "GETINFO request contained unrecognized keywords: {}",
                        unrecognized.join(", ")
                    ),
                    arguments: unrecognized,
                });
            }
            return Err(Error::Protocol(format!(
                "GETINFO response didn't have an OK status:\n{reply}"
            )));
        }

        let mut entries = BTreeMap::new();
        // All lines but the final "250 OK" are key=value entries.
        for line in &reply.lines()[..reply.lines().len() - 1] {
            let Some((key, value)) = line.content().split_once('=') else {
                return Err(Error::Protocol(format!(
                    "GETINFO response contained a non-queried keyword: {}",
                    line.content()
                )));
            };
            // A multi-line value must be of the form `<key>=\n<value>`.
            let value = if value.contains('\n') {
                value.strip_prefix('\n').ok_or_else(|| {
                    Error::Protocol(format!(
                        "GETINFO response contained a malformed data entry for '{key}'"
                    ))
                })?
            } else {
                value
            };
            entries.insert(key.to_owned(), value.to_owned());
        }
        Ok(GetInfoResponse { entries })
    }
}

/// The parsed form of a `GETCONF` reply.
///
/// Each queried option maps to the list of values tor reported for it, in
/// reply order.  A bare keyword (no `=`) means the option is set to its
/// default or is an empty list, and appears as `None`.
#[derive(Clone, Debug)]
pub struct GetConfResponse {
    /// The option-to-values entries of the reply.
    entries: BTreeMap<String, Vec<Option<String>>>,
}

impl GetConfResponse {
    /// Return the entries of this reply.
    pub fn entries(&self) -> &BTreeMap<String, Vec<Option<String>>> {
        &self.entries
    }

    /// Consume this response, returning its entries.
    pub fn into_entries(self) -> BTreeMap<String, Vec<Option<String>>> {
        self.entries
    }
}

impl TryFrom<&Reply> for GetConfResponse {
    type Error = Error;

    fn try_from(reply: &Reply) -> Result<Self> {
        let mut entries: BTreeMap<String, Vec<Option<String>>> = BTreeMap::new();

        // "250 OK" with nothing else means every requested option was
        // recognized but there is nothing to report.
        if reply.lines().len() == 1 && reply.code() == "250" && reply.message() == "OK" {
            return Ok(GetConfResponse { entries });
        }

        if !reply.is_ok() {
            let unrecognized =
                collect_quoted_suffixes(reply, "552", "Unrecognized configuration key \"");
            if !unrecognized.is_empty() {
                return Err(Error::InvalidArguments {
                    code: "552".into(),
                    message: format!(
                        "GETCONF request contained unrecognized keywords: {}",
                        unrecognized.join(", ")
                    ),
                    arguments: unrecognized,
                });
            }
            return Err(Error::Protocol(format!(
                "GETCONF response contained a non-OK status code:\n{reply}"
            )));
        }

        // A multi-line reply may close with a bare "250 OK" terminator;
        // that line is not an entry.  (A real bare keyword on the final
        // line, like "250 DirPort", still is.)
        let mut lines = reply.lines();
        if let [head @ .., last] = lines {
            if !head.is_empty() && last.code() == "250" && last.content() == "OK" {
                lines = head;
            }
        }

        for line in lines {
            let mut tokens = line.tokens();
            let (key, value) = if tokens.is_next_mapping(None, true) {
                let (key, value) = tokens.pop_mapping(true).expect("mapping vanished");
                (key, Some(value.to_owned()))
            } else if tokens.is_next_mapping(None, false) {
                // Unquoted values run to the end of the line, spaces and all.
                let (key, value) = line
                    .content()
                    .split_once('=')
                    .expect("mapping without an =");
                (key, Some(value.to_owned()))
            } else {
                (tokens.pop().unwrap_or(""), None)
            };
            entries.entry(key.to_owned()).or_default().push(value);
        }
        Ok(GetConfResponse { entries })
    }
}

/// The parsed form of a `MAPADDRESS` reply: the address mappings tor
/// established, in reply order.
#[derive(Clone, Debug)]
pub struct MapAddressResponse {
    /// `original -> replacement` pairs, in reply order.
    entries: Vec<(String, String)>,
}

impl MapAddressResponse {
    /// Return the established mappings, in reply order.
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Consume this response, returning its mappings.
    pub fn into_entries(self) -> Vec<(String, String)> {
        self.entries
    }
}

impl TryFrom<&Reply> for MapAddressResponse {
    type Error = Error;

    fn try_from(reply: &Reply) -> Result<Self> {
        if !reply.is_ok() {
            for line in reply.lines() {
                match line.code() {
                    "250" => {}
                    "512" => {
                        return Err(Error::InvalidRequest {
                            code: "512".into(),
                            message: line.content().to_owned(),
                        });
                    }
                    "451" => {
                        return Err(Error::OperationFailed {
                            code: "451".into(),
                            message: line.content().to_owned(),
                        });
                    }
                    other => {
                        return Err(Error::Protocol(format!(
                            "MAPADDRESS returned unexpected response code: {other}"
                        )));
                    }
                }
            }
        }

        let mut entries = Vec::new();
        for line in reply.lines() {
            if line.code() != "250" {
                continue;
            }
            let Some((key, value)) = line.content().split_once('=') else {
                return Err(Error::Protocol(format!(
                    "MAPADDRESS returned '{}' which isn't a mapping",
                    line.content()
                )));
            };
            entries.push((key.to_owned(), value.to_owned()));
        }
        Ok(MapAddressResponse { entries })
    }
}

/// The parsed form of an `AUTHCHALLENGE` reply.
///
/// This is consumed by the safe-cookie authentication exchange, which
/// checks the server hash against its own computation before answering
/// with `AUTHENTICATE`.
#[derive(Clone, Debug)]
pub struct AuthChallengeResponse {
    /// The server hash tor provided.
    server_hash: [u8; 32],
    /// The server nonce tor provided.
    server_nonce: [u8; 32],
}

impl AuthChallengeResponse {
    /// Return the server hash from this response.
    pub fn server_hash(&self) -> &[u8; 32] {
        &self.server_hash
    }

    /// Return the server nonce from this response.
    pub fn server_nonce(&self) -> &[u8; 32] {
        &self.server_nonce
    }
}

impl TryFrom<&Reply> for AuthChallengeResponse {
    type Error = Error;

    fn try_from(reply: &Reply) -> Result<Self> {
        if !reply.is_ok() {
            return Err(Error::Protocol(format!(
                "AUTHCHALLENGE response didn't have an OK status:\n{reply}"
            )));
        }
        let [line] = reply.lines() else {
            return Err(Error::Protocol(format!(
                "Received multiline AUTHCHALLENGE response:\n{reply}"
            )));
        };

        let mut tokens = line.tokens();
        if tokens.pop() != Some("AUTHCHALLENGE") {
            return Err(Error::Protocol(format!(
                "Message is not an AUTHCHALLENGE response: {reply}"
            )));
        }

        let server_hash = pop_hex256_mapping(&mut tokens, "SERVERHASH")?;
        let server_nonce = pop_hex256_mapping(&mut tokens, "SERVERNONCE")?;
        Ok(AuthChallengeResponse {
            server_hash,
            server_nonce,
        })
    }
}

/// Pop the mapping `key=<64 hex digits>` from `tokens`, decoded to bytes.
fn pop_hex256_mapping(
    tokens: &mut crate::msgs::reply::ControlLine<'_>,
    key: &str,
) -> Result<[u8; 32]> {
    if !tokens.is_next_mapping(Some(key), false) {
        return Err(Error::Protocol(format!(
            "Missing {key} mapping: {}",
            tokens.remainder()
        )));
    }
    let (_, value) = tokens.pop_mapping(false).expect("mapping vanished");
    let bytes = (value.len() == 64)
        .then(|| hex::decode(value).ok())
        .flatten()
        .ok_or_else(|| Error::Protocol(format!("{key} has an invalid value: {value}")))?;
    Ok(bytes.try_into().expect("64 hex digits are 32 bytes"))
}

/// Collect, from every line of `reply` with status `code` whose content
/// starts with `prefix` and ends with a double quote, the text between
/// `prefix` and the final quote.
///
/// This is how tor identifies the offending name when it rejects a
/// request: inside the human-readable message, quoted.  The prefixes are
/// part of the stable controller interface.
fn collect_quoted_suffixes(reply: &Reply, code: &str, prefix: &str) -> Vec<String> {
    reply
        .lines()
        .iter()
        .filter(|line| line.code() == code)
        .filter_map(|line| {
            line.content()
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix('"'))
                .map(str::to_owned)
        })
        .collect()
}
