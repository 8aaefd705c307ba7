//! The Allocate handshake used to check one endpoint.
//!
//! ```text
//! Allocate (no credentials)        ──▶
//!                                  ◀── 401/438 + REALM + NONCE
//! Allocate + USERNAME/REALM/NONCE
//!          + MESSAGE-INTEGRITY     ──▶
//!                                  ◀── success, or 438 (stale nonce, one retry)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use huddle_protocol::stun::{long_term_key, Attribute, Message, MessageClass};
use rustls::ClientConfig;
use tracing::debug;

use crate::client::Channel;
use crate::endpoint::TurnEndpoint;
use crate::error::TurnError;

const UNAUTHORIZED: u16 = 401;
const STALE_NONCE: u16 = 438;

/// Long-term credentials for the authenticated Allocate.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Probe settings shared by every check.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Bound on each connect and each request/response exchange.
    pub timeout: Duration,
    pub credentials: Option<Credentials>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            credentials: None,
        }
    }
}

/// Outcome of checking one endpoint.
#[derive(Debug, Clone)]
pub struct TurnCheckResult {
    pub endpoint: TurnEndpoint,
    pub reachable: bool,
    pub auth_valid: bool,
    pub duration: Duration,
    pub checked_at: SystemTime,
    pub error: Option<TurnError>,
}

impl TurnCheckResult {
    fn new(endpoint: TurnEndpoint, duration: Duration, outcome: Result<(), TurnError>) -> Self {
        let (reachable, auth_valid, error) = match outcome {
            Ok(()) => (true, true, None),
            Err(e) => (e.reachable(), false, Some(e)),
        };
        Self {
            endpoint,
            reachable,
            auth_valid,
            duration,
            checked_at: SystemTime::now(),
            error,
        }
    }

    /// A result for a check that never produced an outcome of its own.
    #[must_use]
    pub fn failed(endpoint: TurnEndpoint, duration: Duration, error: TurnError) -> Self {
        Self::new(endpoint, duration, Err(error))
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Check one endpoint. Never fails; the outcome is in the result.
pub async fn check(
    endpoint: TurnEndpoint,
    config: &ProbeConfig,
    tls: &Arc<ClientConfig>,
) -> TurnCheckResult {
    let started = Instant::now();
    let outcome = handshake(&endpoint, config, tls).await;
    let duration = started.elapsed();

    match &outcome {
        Ok(()) => debug!(endpoint = %endpoint, ?duration, "TURN check passed"),
        Err(e) => debug!(endpoint = %endpoint, error = %e, "TURN check failed"),
    }
    TurnCheckResult::new(endpoint, duration, outcome)
}

async fn handshake(
    endpoint: &TurnEndpoint,
    config: &ProbeConfig,
    tls: &Arc<ClientConfig>,
) -> Result<(), TurnError> {
    let mut channel = Channel::connect(endpoint, config.timeout, tls).await?;

    let mut challenge = exchange(&mut channel, &Message::allocate_request(), None).await?;
    match challenge.class {
        // Open relay; nothing left to authenticate.
        MessageClass::SuccessResponse => return Ok(()),
        MessageClass::ErrorResponse => match challenge.error_code() {
            Some((UNAUTHORIZED | STALE_NONCE, _)) => {}
            Some((code, reason)) => {
                return Err(TurnError::Authentication(format!("{code} {reason}")));
            }
            None => return Err(missing_error_code()),
        },
        class => return Err(unexpected_class(class)),
    }

    let credentials = config
        .credentials
        .as_ref()
        .ok_or_else(|| TurnError::Configuration("TURN credentials are not configured".into()))?;

    let mut retried = false;
    loop {
        let realm = challenge
            .realm()
            .ok_or_else(|| TurnError::Protocol("challenge has no REALM".into()))?
            .to_string();
        let nonce = challenge
            .nonce()
            .ok_or_else(|| TurnError::Protocol("challenge has no NONCE".into()))?
            .to_string();

        let key = long_term_key(&credentials.username, &realm, &credentials.password);
        let request = Message::allocate_request()
            .with_attribute(Attribute::Username(credentials.username.clone()))
            .with_attribute(Attribute::Realm(realm))
            .with_attribute(Attribute::Nonce(nonce));

        let response = exchange(&mut channel, &request, Some(&key[..])).await?;
        match response.class {
            MessageClass::SuccessResponse => return Ok(()),
            MessageClass::ErrorResponse => {
                let (code, reason) = response
                    .error_code()
                    .map(|(code, reason)| (code, reason.to_string()))
                    .ok_or_else(missing_error_code)?;
                if code != STALE_NONCE || retried {
                    return Err(TurnError::Authentication(format!("{code} {reason}")));
                }
                debug!(endpoint = %endpoint, "Stale nonce, retrying once");
                retried = true;
                challenge = response;
            }
            class => return Err(unexpected_class(class)),
        }
    }
}

async fn exchange(
    channel: &mut Channel,
    request: &Message,
    key: Option<&[u8]>,
) -> Result<Message, TurnError> {
    let encoded = request.encode(key)?;
    let raw = channel.round_trip(&encoded).await?;
    let response = Message::decode(&raw)?;

    if response.transaction_id != request.transaction_id {
        return Err(TurnError::Protocol("transaction id mismatch".into()));
    }
    if response.method != request.method {
        return Err(TurnError::Protocol(format!(
            "response method {:#05x} does not match request",
            response.method
        )));
    }
    Ok(response)
}

fn missing_error_code() -> TurnError {
    TurnError::Protocol("error response without ERROR-CODE".into())
}

fn unexpected_class(class: MessageClass) -> TurnError {
    TurnError::Protocol(format!("unexpected {class:?} in reply"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let rendered = format!("{:?}", Credentials::new("probe", "hunter2"));
        assert!(rendered.contains("probe"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_result_from_outcome() {
        let endpoint = TurnEndpoint::new("turn:h", "h", 3478, crate::Transport::Udp);

        let ok = TurnCheckResult::new(endpoint.clone(), Duration::ZERO, Ok(()));
        assert!(ok.reachable && ok.auth_valid && ok.is_success());

        let auth = TurnCheckResult::failed(
            endpoint.clone(),
            Duration::ZERO,
            TurnError::Authentication("401".into()),
        );
        assert!(auth.reachable);
        assert!(!auth.auth_valid);

        let down = TurnCheckResult::failed(endpoint, Duration::ZERO, TurnError::Connection("refused".into()));
        assert!(!down.reachable);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connect_failure() {
        // Bind then drop to find a loopback port with nothing behind it.
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        drop(socket);

        let endpoint = TurnEndpoint::new("turn:127.0.0.1", "127.0.0.1", port, crate::Transport::Tcp);
        let config = ProbeConfig {
            timeout: Duration::from_millis(500),
            credentials: None,
        };
        let result = check(endpoint, &config, &crate::client::tls_config()).await;
        assert!(!result.reachable);
        assert_eq!(result.error.unwrap().category(), "connect");
    }
}
