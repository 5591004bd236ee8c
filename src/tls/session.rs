use std::ffi::c_int;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use tracing::warn;

use crate::errors::{GatewayError, Want};
use crate::gateway::capability::Capability;
use crate::gateway::facade::{SslHandle, SslRuntime, X509_V_OK, X509Handle};

// -----------------------------------------------------------------------------
// ----- SslSession ------------------------------------------------------------

/// Owned client `SSL` bound to a socket the caller keeps open.
///
/// Every I/O method is a single non-blocking step: `WouldBlock` means wait
/// for the reported readiness and call again.
pub struct SslSession {
    runtime: Arc<SslRuntime>,
    handle: ManuallyDrop<SslHandle>,
}

impl SslSession {
    pub(crate) fn new(runtime: Arc<SslRuntime>, handle: SslHandle) -> Self {
        Self {
            runtime,
            handle: ManuallyDrop::new(handle),
        }
    }

    pub fn handle(&self) -> &SslHandle {
        &self.handle
    }

    pub fn set_fd(&self, fd: c_int) -> Result<(), GatewayError> {
        self.runtime.ssl_set_fd(&self.handle, fd)
    }

    pub fn fd(&self) -> Result<Option<c_int>, GatewayError> {
        self.runtime.ssl_get_fd(&self.handle)
    }

    pub fn set_connect_state(&self) -> Result<(), GatewayError> {
        self.runtime.ssl_set_connect_state(&self.handle)
    }

    pub fn set_host_name(&self, host: &str) -> Result<(), GatewayError> {
        self.runtime.ssl_set_host_name(&self.handle, host)
    }

    pub fn handshake(&self) -> Result<(), GatewayError> {
        self.runtime.connect(&self.handle)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, GatewayError> {
        self.runtime.read(&self.handle, buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, GatewayError> {
        self.runtime.write(&self.handle, buf)
    }

    pub fn pending(&self) -> Result<usize, GatewayError> {
        self.runtime.pending(&self.handle)
    }

    pub fn want(&self) -> Result<Option<Want>, GatewayError> {
        self.runtime.want(&self.handle)
    }

    pub fn verify_result(&self) -> Result<i64, GatewayError> {
        self.runtime.verify_result(&self.handle)
    }

    /// Fails unless the peer chain verified against the configured CA.
    pub fn check_verified(&self) -> Result<(), GatewayError> {
        verified(self.verify_result()?)
    }

    pub fn peer_certificate(&self) -> Result<Option<PeerCertificate>, GatewayError> {
        let cert = self.runtime.peer_certificate(&self.handle)?;
        Ok(cert.map(|handle| PeerCertificate::new(self.runtime.clone(), handle)))
    }
}

impl Drop for SslSession {
    fn drop(&mut self) {
        // Safety: `handle` is never touched again after this point.
        let handle = unsafe { ManuallyDrop::take(&mut self.handle) };
        if let Err(err) = self.runtime.ssl_free(handle) {
            warn!("failed to release ssl session: {err}");
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PeerCertificate -------------------------------------------------------

/// Server certificate reference held by the caller; released on drop.
pub struct PeerCertificate {
    runtime: Arc<SslRuntime>,
    handle: ManuallyDrop<X509Handle>,
}

impl PeerCertificate {
    pub(crate) fn new(runtime: Arc<SslRuntime>, handle: X509Handle) -> Self {
        Self {
            runtime,
            handle: ManuallyDrop::new(handle),
        }
    }

    pub fn handle(&self) -> &X509Handle {
        &self.handle
    }
}

impl Drop for PeerCertificate {
    fn drop(&mut self) {
        // Safety: `handle` is never touched again after this point.
        let handle = unsafe { ManuallyDrop::take(&mut self.handle) };
        if let Err(err) = self.runtime.x509_free(handle) {
            warn!("failed to release peer certificate: {err}");
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

pub(crate) fn verified(result: i64) -> Result<(), GatewayError> {
    if result == X509_V_OK {
        return Ok(());
    }
    Err(GatewayError::Transport {
        capability: Capability::GetVerifyResult,
        code: u64::try_from(result).ok(),
        message: format!("peer certificate verification failed (X509 result {result})"),
    })
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
