//! Async TLS client stream: a tokio socket whose bytes go through an
//! [`SslSession`]. The session performs the socket I/O itself; tokio is only
//! asked for readiness whenever a step reports `WouldBlock`.

use std::ffi::c_int;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::context::SecureContext;
use super::session::{PeerCertificate, SslSession};
use crate::config::SslSettings;
use crate::errors::{GatewayError, Want};
use crate::gateway::facade::SslRuntime;
use crate::gateway::lifecycle::SslGateway;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const READ_CHUNK: usize = 16 * 1024;

// -----------------------------------------------------------------------------
// ----- StreamError -----------------------------------------------------------

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("tls handshake did not finish within {}", humantime::format_duration(*.0))]
    HandshakeTimeout(Duration),

    #[error("tls is disabled by the connection settings")]
    Disabled,
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(err) => err,
            StreamError::Gateway(err) => err.into(),
            StreamError::HandshakeTimeout(_) => io::Error::new(io::ErrorKind::TimedOut, err),
            StreamError::Disabled => io::Error::new(io::ErrorKind::InvalidInput, err),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SecureStream ----------------------------------------------------------

/// Field order is drop order: session, then context, then the socket.
pub struct SecureStream {
    session: SslSession,
    context: SecureContext,
    stream: TcpStream,
}

// -----------------------------------------------------------------------------
// ----- SecureStream: Static --------------------------------------------------

impl SecureStream {
    /// Connect through the process-wide gateway.
    pub async fn connect(addr: &str, settings: &SslSettings) -> Result<Self, StreamError> {
        let runtime = SslGateway::global().runtime()?;
        Self::connect_with(runtime, addr, settings).await
    }

    pub async fn connect_with(
        runtime: Arc<SslRuntime>,
        addr: &str,
        settings: &SslSettings,
    ) -> Result<Self, StreamError> {
        if !settings.is_enabled() {
            return Err(StreamError::Disabled);
        }

        let stream = TcpStream::connect(addr).await?;
        let server_name = server_name_for(addr, settings);
        Self::upgrade(runtime, stream, server_name.as_deref(), settings).await
    }

    /// Run the client handshake over an already connected socket.
    pub async fn upgrade(
        runtime: Arc<SslRuntime>,
        stream: TcpStream,
        server_name: Option<&str>,
        settings: &SslSettings,
    ) -> Result<Self, StreamError> {
        stream.set_nodelay(true)?;

        let context = SecureContext::client(runtime, settings)?;
        let session = context.new_session()?;
        session.set_fd(raw_socket(&stream)?)?;
        if let Some(name) = server_name {
            session.set_host_name(name)?;
        }

        let mut secure = SecureStream {
            session,
            context,
            stream,
        };

        match settings.handshake_timeout {
            Some(limit) => timeout(limit, secure.handshake())
                .await
                .map_err(|_| StreamError::HandshakeTimeout(limit))??,
            None => secure.handshake().await?,
        }

        if settings.verify_peer {
            secure.session.check_verified()?;
        }

        debug!("tls session established with {}", secure.stream.peer_addr()?);
        Ok(secure)
    }
}

// -----------------------------------------------------------------------------
// ----- SecureStream: Public --------------------------------------------------

impl SecureStream {
    /// `Ok(0)` once the peer closed the TLS session.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.drive(|session| session.read(buf)).await
    }

    /// Append whatever is available (up to one chunk) to `buf`.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, StreamError> {
        let start = buf.len();
        buf.resize(start + READ_CHUNK, 0);

        let result = self.read(&mut buf[start..]).await;
        let n = *result.as_ref().unwrap_or(&0);
        buf.truncate(start + n);

        result
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize, StreamError> {
        if data.is_empty() {
            return Ok(0);
        }
        self.drive(|session| session.write(data)).await
    }

    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<(), StreamError> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    pub fn session(&self) -> &SslSession {
        &self.session
    }

    pub fn context(&self) -> &SecureContext {
        &self.context
    }

    pub fn verify_result(&self) -> Result<i64, GatewayError> {
        self.session.verify_result()
    }

    pub fn peer_certificate(&self) -> Result<Option<PeerCertificate>, GatewayError> {
        self.session.peer_certificate()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

// -----------------------------------------------------------------------------
// ----- SecureStream: Private -------------------------------------------------

impl SecureStream {
    async fn handshake(&mut self) -> Result<(), StreamError> {
        self.drive(SslSession::handshake).await
    }

    /// Repeat `op` until it stops reporting `WouldBlock`. The first attempt
    /// runs immediately since the session may already hold buffered data.
    /// After that, readiness is cleared only when `op` blocked on the
    /// direction that was awaited.
    async fn drive<T, F>(&mut self, mut op: F) -> Result<T, StreamError>
    where
        F: FnMut(&SslSession) -> Result<T, GatewayError>,
    {
        let mut want = match op(&self.session) {
            Err(GatewayError::WouldBlock(want)) => want,
            other => return other.map_err(StreamError::from),
        };

        loop {
            trace!("tls stream waiting for socket to become {}", want.as_str());
            let interest = interest_for(want);
            self.stream.ready(interest).await?;

            let outcome = self.stream.try_io(interest, || match op(&self.session) {
                Err(GatewayError::WouldBlock(next)) if next == want => {
                    Err(io::ErrorKind::WouldBlock.into())
                }
                other => Ok(other),
            });

            match outcome {
                Ok(Err(GatewayError::WouldBlock(next))) => want = next,
                Ok(result) => return result.map_err(StreamError::from),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn interest_for(want: Want) -> Interest {
    match want {
        Want::Read => Interest::READABLE,
        Want::Write => Interest::WRITABLE,
    }
}

/// Explicit setting first, else the host part of `addr` unless it is an IP.
pub fn server_name_for(addr: &str, settings: &SslSettings) -> Option<String> {
    if let Some(name) = &settings.server_name {
        return Some(name.clone());
    }

    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if host.is_empty() || host.parse::<IpAddr>().is_ok() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(unix)]
fn raw_socket(stream: &TcpStream) -> Result<c_int, GatewayError> {
    use std::os::fd::AsRawFd;
    Ok(stream.as_raw_fd())
}

#[cfg(windows)]
fn raw_socket(stream: &TcpStream) -> Result<c_int, GatewayError> {
    use std::os::windows::io::AsRawSocket;
    c_int::try_from(stream.as_raw_socket())
        .map_err(|_| GatewayError::invalid("socket handle does not fit in a C int"))
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
