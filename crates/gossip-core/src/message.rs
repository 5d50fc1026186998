//! Gossip message wire format.
//!
//! Each gossip message travels as a single line of text:
//!
//! ```text
//! <timestamp>:<originatorIP>:Msg#<seq> - Gossip broadcast from <originatorIP>:<originatorPort>
//! ```
//!
//! The timestamp is opaque and may itself contain `:` (e.g. `2025-01-01 12:00:00`),
//! so parsing anchors on the fixed markers rather than splitting on colons.

use crate::address::{parse_decimal, PeerAddress};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Number of messages every peer originates per run.
pub const MESSAGES_PER_RUN: u32 = 10;

const SEQ_MARKER: &str = ":Msg#";
const BROADCAST_MARKER: &str = " - Gossip broadcast from ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("Malformed gossip message: {reason} ({line:?})")]
    Malformed { line: String, reason: &'static str },
}

impl MessageError {
    fn malformed(line: &str, reason: &'static str) -> Self {
        Self::Malformed {
            line: line.to_string(),
            reason,
        }
    }
}

/// Identity of a gossip message, used for dedup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub sender: PeerAddress,
    pub seq: u32,
}

/// A gossip message. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    sender: PeerAddress,
    seq: u32,
    timestamp: String,
}

impl GossipMessage {
    /// Create a message. Sequence numbers start at 1.
    pub fn new(sender: PeerAddress, seq: u32, timestamp: impl Into<String>) -> Result<Self, MessageError> {
        let timestamp = timestamp.into();
        if seq == 0 {
            return Err(MessageError::malformed(&timestamp, "sequence number must be >= 1"));
        }
        if timestamp.is_empty() || timestamp.contains('\n') {
            return Err(MessageError::malformed(&timestamp, "invalid timestamp"));
        }
        Ok(Self {
            sender,
            seq,
            timestamp,
        })
    }

    pub fn sender(&self) -> &PeerAddress {
        &self.sender
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn id(&self) -> MessageId {
        MessageId {
            sender: self.sender.clone(),
            seq: self.seq,
        }
    }

    /// Encode as a wire line (no trailing newline).
    pub fn to_line(&self) -> String {
        self.to_string()
    }

    /// Parse a wire line. Surrounding whitespace is ignored.
    pub fn parse(line: &str) -> Result<Self, MessageError> {
        let trimmed = line.trim();

        let (head, origin) = trimmed
            .split_once(BROADCAST_MARKER)
            .ok_or_else(|| MessageError::malformed(line, "missing broadcast marker"))?;
        let sender: PeerAddress = origin
            .parse()
            .map_err(|_| MessageError::malformed(line, "invalid originator address"))?;

        let (prefix, seq) = head
            .rsplit_once(SEQ_MARKER)
            .ok_or_else(|| MessageError::malformed(line, "missing sequence marker"))?;
        let seq: u32 = parse_decimal(seq)
            .ok_or_else(|| MessageError::malformed(line, "invalid sequence number"))?;

        let timestamp = prefix
            .strip_suffix(sender.host())
            .and_then(|rest| rest.strip_suffix(':'))
            .ok_or_else(|| MessageError::malformed(line, "originator IP mismatch"))?;

        Self::new(sender, seq, timestamp).map_err(|_| MessageError::malformed(line, "invalid header"))
    }
}

impl Display for GossipMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}{}{}{}{}",
            self.timestamp,
            self.sender.host(),
            SEQ_MARKER,
            self.seq,
            BROADCAST_MARKER,
            self.sender
        )
    }
}
