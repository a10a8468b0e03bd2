//! Endpoint addresses of the form `scheme://host:port`.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Result, WorkerError};

/// Default scheme when an address omits one.
pub const DEFAULT_SCHEME: &str = "tcp";

/// A parsed endpoint address.
///
/// Accepted input forms, mirroring what the wider cluster tolerates:
/// `tcp://10.0.0.1:8786`, `10.0.0.1:8786`, `10.0.0.1:` (port 0),
/// `10.0.0.1` (port 0), and a bare integer, which is read as a packed
/// IPv4 address with port 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    scheme: String,
    host: String,
    port: u16,
}

impl Address {
    /// Create an address with an explicit scheme.
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self { scheme: scheme.into(), host: host.into(), port }
    }

    /// Create a `tcp://` address.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(DEFAULT_SCHEME, host, port)
    }

    /// Parse an address string.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(WorkerError::AddressParse { input: input.into() });
        }

        let (scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() => (scheme, rest),
            Some(_) => return Err(WorkerError::AddressParse { input: input.into() }),
            None => (DEFAULT_SCHEME, input),
        };
        if rest.is_empty() {
            return Err(WorkerError::AddressParse { input: input.into() });
        }

        // Bare integer: a packed IPv4 address.
        if rest.bytes().all(|b| b.is_ascii_digit()) {
            let packed: u32 = rest
                .parse()
                .map_err(|_| WorkerError::AddressParse { input: input.into() })?;
            return Ok(Self::new(scheme, Ipv4Addr::from(packed).to_string(), 0));
        }

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, "")) => (host, 0),
            Some((host, port)) => (
                host,
                port.parse()
                    .map_err(|_| WorkerError::AddressParse { input: input.into() })?,
            ),
            None => (rest, 0),
        };
        if host.is_empty() {
            return Err(WorkerError::AddressParse { input: input.into() });
        }

        Ok(Self::new(scheme, host, port))
    }

    /// Scheme part, e.g. `tcp`.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part; 0 when the input carried none.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same host and scheme with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.scheme.clone(), self.host.clone(), port)
    }

    /// Dialable `(host, port)` pair.
    pub fn host_port(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
