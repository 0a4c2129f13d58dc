//! Messages that cross a control-port connection.
//!
//! [`reply`](crate::msgs::reply) holds the parsed reply model and its
//! tokenizer, [`codec`](crate::msgs::codec) the wire framing, and
//! [`response`](crate::msgs::response) the typed per-command views.

pub(crate) mod codec;
pub mod reply;
pub mod response;
