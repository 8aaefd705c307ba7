//! Request/response exchange with a TURN server over UDP, TCP or TLS.
//!
//! UDP carries one message per datagram. Stream transports read the fixed
//! STUN header first and then exactly the length it declares.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use huddle_protocol::stun::{declared_length, HEADER_SIZE};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::endpoint::{Transport, TurnEndpoint};
use crate::error::TurnError;

/// Largest datagram the probe accepts.
const MAX_DATAGRAM: usize = 2048;

/// TLS settings trusting the bundled web PKI roots.
#[must_use]
pub fn tls_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

enum Stream {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// An open connection to one endpoint.
pub struct Channel {
    stream: Stream,
    timeout: Duration,
}

impl Channel {
    /// Connect to `endpoint`. `timeout` bounds the connect and every later
    /// exchange separately.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::Connection`] if the endpoint cannot be reached.
    pub async fn connect(
        endpoint: &TurnEndpoint,
        timeout: Duration,
        tls: &Arc<ClientConfig>,
    ) -> Result<Self, TurnError> {
        let stream = tokio::time::timeout(timeout, open(endpoint, tls))
            .await
            .map_err(|_| TurnError::Connection(format!("connect to {endpoint} timed out")))??;

        debug!(endpoint = %endpoint, "Connected");
        Ok(Self { stream, timeout })
    }

    /// Send one encoded request and read one response.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::Connection`] on I/O failure or timeout and
    /// [`TurnError::Protocol`] if the response is not framed as STUN.
    pub async fn round_trip(&mut self, request: &[u8]) -> Result<Bytes, TurnError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.exchange(request))
            .await
            .map_err(|_| TurnError::Connection(format!("no response within {timeout:?}")))?
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Bytes, TurnError> {
        match &mut self.stream {
            Stream::Udp(socket) => {
                socket.send(request).await.map_err(io_error)?;
                let mut buf = vec![0u8; MAX_DATAGRAM];
                let len = socket.recv(&mut buf).await.map_err(io_error)?;
                buf.truncate(len);
                Ok(Bytes::from(buf))
            }
            Stream::Tcp(stream) => write_then_read(stream, request).await,
            Stream::Tls(stream) => write_then_read(stream.as_mut(), request).await,
        }
    }
}

async fn open(endpoint: &TurnEndpoint, tls: &Arc<ClientConfig>) -> Result<Stream, TurnError> {
    let address = lookup_host(endpoint.address())
        .await
        .map_err(io_error)?
        .next()
        .ok_or_else(|| TurnError::Connection(format!("{} did not resolve", endpoint.host)))?;

    match endpoint.transport {
        Transport::Udp => {
            let bind = if address.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
            let socket = UdpSocket::bind(bind).await.map_err(io_error)?;
            socket.connect(address).await.map_err(io_error)?;
            Ok(Stream::Udp(socket))
        }
        Transport::Tcp => {
            let stream = TcpStream::connect(address).await.map_err(io_error)?;
            Ok(Stream::Tcp(stream))
        }
        Transport::Tls => {
            let server_name = ServerName::try_from(endpoint.host.clone()).map_err(|e| {
                TurnError::Configuration(format!("invalid TLS server name '{}': {e}", endpoint.host))
            })?;
            let tcp = TcpStream::connect(address).await.map_err(io_error)?;
            let stream = TlsConnector::from(Arc::clone(tls))
                .connect(server_name, tcp)
                .await
                .map_err(|e| TurnError::Connection(format!("TLS handshake failed: {e}")))?;
            Ok(Stream::Tls(Box::new(stream)))
        }
    }
}

async fn write_then_read<S>(stream: &mut S, request: &[u8]) -> Result<Bytes, TurnError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await.map_err(io_error)?;
    stream.flush().await.map_err(io_error)?;

    let mut message = vec![0u8; HEADER_SIZE];
    stream.read_exact(&mut message).await.map_err(io_error)?;
    let body = declared_length(&message)?;
    message.resize(HEADER_SIZE + body, 0);
    stream
        .read_exact(&mut message[HEADER_SIZE..])
        .await
        .map_err(io_error)?;
    Ok(Bytes::from(message))
}

fn io_error(err: std::io::Error) -> TurnError {
    TurnError::Connection(err.to_string())
}
