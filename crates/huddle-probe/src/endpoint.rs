//! TURN URL parsing and endpoint expansion.
//!
//! A configured URL such as `turns:relay.example.com:443?transport=tcp`
//! expands into the well-known ports (3478/UDP and 5349/TLS) for its host
//! plus the explicit port it names, if any.

use std::fmt;
use std::str::FromStr;

use crate::error::TurnError;

/// Plain TURN port, probed over UDP.
pub const DEFAULT_TURN_PORT: u16 = 3478;

/// TURN over TLS port.
pub const DEFAULT_TURNS_PORT: u16 = 5349;

/// How an endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

impl Transport {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = TurnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "tls" => Ok(Transport::Tls),
            other => Err(TurnError::Configuration(format!(
                "unsupported transport '{other}'"
            ))),
        }
    }
}

/// One probe target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TurnEndpoint {
    /// The configured URL this endpoint came from.
    pub url: String,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
}

impl TurnEndpoint {
    #[must_use]
    pub fn new(url: impl Into<String>, host: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            url: url.into(),
            host: host.into(),
            port,
            transport,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Parse a `turn:` or `turns:` URL and expand it into endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::Configuration`] if the URL cannot be parsed.
    pub fn expand(url: &str) -> Result<Vec<TurnEndpoint>, TurnError> {
        let parsed = ParsedUrl::parse(url)?;

        let mut endpoints = vec![
            TurnEndpoint::new(url, &parsed.host, DEFAULT_TURN_PORT, Transport::Udp),
            TurnEndpoint::new(url, &parsed.host, DEFAULT_TURNS_PORT, Transport::Tls),
        ];

        if let Some(port) = parsed.port {
            let transport = match (parsed.secure, parsed.transport) {
                (true, _) => Transport::Tls,
                (false, Some(transport)) => transport,
                (false, None) => Transport::Udp,
            };
            let explicit = TurnEndpoint::new(url, &parsed.host, port, transport);
            if !endpoints.contains(&explicit) {
                endpoints.push(explicit);
            }
        }

        Ok(endpoints)
    }
}

impl fmt::Display for TurnEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address(), self.transport)
    }
}

/// Expand every URL, dropping endpoints that several URLs share.
///
/// # Errors
///
/// Returns the first URL that fails to parse.
pub fn expand_all<S: AsRef<str>>(urls: &[S]) -> Result<Vec<TurnEndpoint>, TurnError> {
    let mut endpoints: Vec<TurnEndpoint> = Vec::new();
    for url in urls {
        for endpoint in TurnEndpoint::expand(url.as_ref())? {
            let duplicate = endpoints.iter().any(|e| {
                e.host == endpoint.host && e.port == endpoint.port && e.transport == endpoint.transport
            });
            if !duplicate {
                endpoints.push(endpoint);
            }
        }
    }
    Ok(endpoints)
}

#[derive(Debug)]
struct ParsedUrl {
    secure: bool,
    host: String,
    port: Option<u16>,
    transport: Option<Transport>,
}

impl ParsedUrl {
    fn parse(url: &str) -> Result<Self, TurnError> {
        let invalid = |reason: &str| TurnError::Configuration(format!("invalid TURN URL '{url}': {reason}"));

        let trimmed = url.trim();
        let (secure, rest) = if let Some(rest) = trimmed.strip_prefix("turns:") {
            (true, rest)
        } else if let Some(rest) = trimmed.strip_prefix("turn:") {
            (false, rest)
        } else {
            return Err(invalid("expected turn: or turns: scheme"));
        };
        let rest = rest.strip_prefix("//").unwrap_or(rest);

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };

        let mut transport = None;
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if let Some(value) = pair.strip_prefix("transport=") {
                transport = Some(value.parse()?);
            }
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = match after.strip_prefix(':') {
                Some(port) => Some(port),
                None if after.is_empty() => None,
                None => return Err(invalid("unexpected text after host")),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port
            .map(|p| p.parse::<u16>().map_err(|_| invalid("bad port")))
            .transpose()?;

        Ok(Self {
            secure,
            host: host.to_string(),
            port,
            transport,
        })
    }
}
