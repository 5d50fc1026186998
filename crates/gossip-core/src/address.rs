//! PeerAddress: the identity of a node in the gossip network.
//!
//! A node is known by the `(host, port)` pair it listens on. The same value is
//! the key in every registry, the sender ID of every gossip message, and the
//! probe target of every liveness check.
//!
//! IPv6 hosts are written bracketed (`[::1]:8000`), everything else as plain
//! `host:port`.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::net::Ipv6Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address format: expected host:port, got {0:?}")]
    InvalidFormat(String),
    #[error("Host cannot be empty")]
    EmptyHost,
    #[error("Host cannot contain whitespace, or ':' outside an IPv6 address ({0:?})")]
    InvalidHost(String),
    #[error("Port must be in 1..=65535")]
    InvalidPort,
}

/// The `(host, port)` identity of a seed or peer.
///
/// Immutable once created. Construct through [`PeerAddress::new`] or
/// [`str::parse`] so malformed values never reach a registry.
///
/// # Examples
/// ```
/// use gossip_core::PeerAddress;
///
/// let addr: PeerAddress = "127.0.0.1:8000".parse().unwrap();
/// assert_eq!(addr.host(), "127.0.0.1");
/// assert_eq!(addr.port(), 8000);
/// assert_eq!(addr.to_string(), "127.0.0.1:8000");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawAddress", into = "RawAddress")]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    /// Create a validated address.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, AddressError> {
        let host = host.into();
        if host.is_empty() {
            return Err(AddressError::EmptyHost);
        }
        if host.chars().any(char::is_whitespace)
            || (host.contains(':') && host.parse::<Ipv6Addr>().is_err())
        {
            return Err(AddressError::InvalidHost(host));
        }
        if port == 0 {
            return Err(AddressError::InvalidPort);
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// WebSocket URL for dialing this address.
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self)
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressError::InvalidFormat(s.to_string());
        let (host, port) = match s.strip_prefix('[') {
            Some(rest) => rest.split_once("]:").ok_or_else(invalid)?,
            None => match s.rsplit_once(':') {
                // An IPv6 host must be bracketed
                Some((host, _)) if host.contains(':') => return Err(invalid()),
                Some(parts) => parts,
                None => return Err(invalid()),
            },
        };
        let port: u16 = parse_decimal(port).ok_or_else(invalid)?;
        Self::new(host, port)
    }
}

/// Parse a plain decimal number: ASCII digits only, no sign, no leading zero.
pub(crate) fn parse_decimal<T: FromStr>(s: &str) -> Option<T> {
    let canonical = !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit())
        && (s == "0" || !s.starts_with('0'));
    if canonical { s.parse().ok() } else { None }
}

/// Unvalidated wire shape: `{"host": "...", "port": 1234}`.
#[derive(Serialize, Deserialize)]
struct RawAddress {
    host: String,
    port: u16,
}

impl TryFrom<RawAddress> for PeerAddress {
    type Error = AddressError;

    fn try_from(raw: RawAddress) -> Result<Self, Self::Error> {
        Self::new(raw.host, raw.port)
    }
}

impl From<PeerAddress> for RawAddress {
    fn from(addr: PeerAddress) -> Self {
        Self {
            host: addr.host,
            port: addr.port,
        }
    }
}
