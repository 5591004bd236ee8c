use std::ffi::c_int;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use tracing::{debug, warn};

use super::session::{PeerCertificate, verified};
use crate::errors::GatewayError;
use crate::gateway::facade::{BioHandle, SslRuntime};

// -----------------------------------------------------------------------------
// ----- BioConnection ---------------------------------------------------------

/// TLS connection where the runtime owns the socket (`BIO_new_ssl_connect`).
/// The socket is opened by the first handshake step. Blocking unless
/// [`BioConnection::set_non_blocking`] was called.
pub struct BioConnection {
    runtime: Arc<SslRuntime>,
    bio: ManuallyDrop<BioHandle>,
    address: String,
}

impl BioConnection {
    pub(crate) fn new(
        runtime: Arc<SslRuntime>,
        bio: BioHandle,
        address: &str,
        server_name: Option<&str>,
    ) -> Result<Self, GatewayError> {
        let conn = Self {
            runtime,
            bio: ManuallyDrop::new(bio),
            address: address.to_string(),
        };

        conn.runtime.bio_set_conn_hostname(&conn.bio, address)?;
        if let Some(name) = server_name {
            let ssl = conn.runtime.bio_get_ssl(&conn.bio)?;
            conn.runtime.ssl_set_host_name(&ssl, name)?;
        }

        Ok(conn)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_non_blocking(&self, non_blocking: bool) -> Result<(), GatewayError> {
        self.runtime.bio_set_nbio(&self.bio, non_blocking)
    }

    pub fn handshake(&self) -> Result<(), GatewayError> {
        let ssl = self.runtime.bio_get_ssl(&self.bio)?;
        self.runtime.connect(&ssl)?;
        debug!("bio handshake with {} complete", self.address);
        Ok(())
    }

    /// Socket the chain opened; `None` before the first handshake step.
    pub fn fd(&self) -> Result<Option<c_int>, GatewayError> {
        self.runtime.bio_get_fd(&self.bio)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, GatewayError> {
        let ssl = self.runtime.bio_get_ssl(&self.bio)?;
        self.runtime.read(&ssl, buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, GatewayError> {
        let ssl = self.runtime.bio_get_ssl(&self.bio)?;
        self.runtime.write(&ssl, buf)
    }

    pub fn verify_result(&self) -> Result<i64, GatewayError> {
        let ssl = self.runtime.bio_get_ssl(&self.bio)?;
        self.runtime.verify_result(&ssl)
    }

    pub fn check_verified(&self) -> Result<(), GatewayError> {
        verified(self.verify_result()?)
    }

    pub fn peer_certificate(&self) -> Result<Option<PeerCertificate>, GatewayError> {
        let ssl = self.runtime.bio_get_ssl(&self.bio)?;
        let cert = self.runtime.peer_certificate(&ssl)?;
        Ok(cert.map(|handle| PeerCertificate::new(self.runtime.clone(), handle)))
    }
}

impl Drop for BioConnection {
    fn drop(&mut self) {
        // Safety: `bio` is never touched again after this point.
        let bio = unsafe { ManuallyDrop::take(&mut self.bio) };
        if let Err(err) = self.runtime.bio_free_all(bio) {
            warn!("failed to release bio chain for {}: {err}", self.address);
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
