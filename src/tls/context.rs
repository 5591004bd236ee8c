use std::mem::ManuallyDrop;
use std::sync::Arc;

use tracing::{debug, warn};

use super::bio::BioConnection;
use super::session::SslSession;
use crate::config::SslSettings;
use crate::errors::GatewayError;
use crate::gateway::capability::Capability;
use crate::gateway::facade::{
    CtxHandle, SSL_OP_NO_COMPRESSION, SSL_OP_NO_SSLV2, SSL_OP_NO_SSLV3, SslRuntime, VerifyMode,
};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

/// Always on: no SSLv3 and no TLS compression.
pub const BASELINE_OPTIONS: u64 = SSL_OP_NO_SSLV3 | SSL_OP_NO_COMPRESSION;

/// Options forced on every context. The SSLv2 bit only means "no SSLv2" on
/// 1.0.x; later releases reuse it for an unrelated server option.
pub fn baseline_options(runtime: &SslRuntime) -> u64 {
    if runtime.is_legacy() {
        BASELINE_OPTIONS | SSL_OP_NO_SSLV2
    } else {
        BASELINE_OPTIONS
    }
}

// -----------------------------------------------------------------------------
// ----- SecureContext ---------------------------------------------------------

/// Owned `SSL_CTX` configured for client connections. Freed on drop.
pub struct SecureContext {
    runtime: Arc<SslRuntime>,
    handle: ManuallyDrop<CtxHandle>,
    options: u64,
}

// -----------------------------------------------------------------------------
// ----- SecureContext: Static -------------------------------------------------

impl SecureContext {
    pub fn client(runtime: Arc<SslRuntime>, settings: &SslSettings) -> Result<Self, GatewayError> {
        let method = runtime.client_method()?;
        let handle = runtime.ctx_new(method)?;

        let mut ctx = SecureContext {
            runtime,
            handle: ManuallyDrop::new(handle),
            options: 0,
        };
        ctx.configure(settings)?;

        Ok(ctx)
    }
}

// -----------------------------------------------------------------------------
// ----- SecureContext: Public -------------------------------------------------

impl SecureContext {
    pub fn runtime(&self) -> &Arc<SslRuntime> {
        &self.runtime
    }

    pub fn handle(&self) -> &CtxHandle {
        &self.handle
    }

    /// Option mask reported by the library after configuration.
    pub fn options(&self) -> u64 {
        self.options
    }

    /// Fresh session in client mode, not yet bound to a socket.
    pub fn new_session(&self) -> Result<SslSession, GatewayError> {
        let handle = self.runtime.ssl_new(&self.handle)?;
        let session = SslSession::new(self.runtime.clone(), handle);
        session.set_connect_state()?;
        Ok(session)
    }

    /// BIO chain that dials `address` (`host:port`) itself.
    pub fn connect_bio(
        &self,
        address: &str,
        server_name: Option<&str>,
    ) -> Result<BioConnection, GatewayError> {
        let bio = self.runtime.bio_new_ssl_connect(&self.handle)?;
        BioConnection::new(self.runtime.clone(), bio, address, server_name)
    }
}

// -----------------------------------------------------------------------------
// ----- SecureContext: Private ------------------------------------------------

impl SecureContext {
    fn configure(&mut self, settings: &SslSettings) -> Result<(), GatewayError> {
        let runtime = &self.runtime;
        let ctx: &CtxHandle = &self.handle;

        self.options = runtime.ctx_set_options(ctx, baseline_options(runtime))?;

        if settings.verify_peer {
            runtime.ctx_set_verify(ctx, VerifyMode::Peer)?;
            runtime.ctx_set_verify_depth(ctx, settings.verify_depth)?;
        } else {
            runtime.ctx_set_verify(ctx, VerifyMode::None)?;
        }

        if let Some(ca_file) = &settings.ca_file {
            runtime.ctx_load_verify_locations(ctx, Some(ca_file), None)?;
        }

        if let (Some(cert), Some(key)) = (&settings.cert_file, &settings.key_file) {
            runtime.ctx_use_certificate_chain_file(ctx, cert)?;
            runtime.ctx_use_private_key_file(ctx, key)?;
        }

        if let Some(ciphers) = &settings.cipher_list {
            runtime.ctx_set_cipher_list(ctx, ciphers)?;
        }

        if let Some(suites) = &settings.ciphersuites {
            if runtime.is_supported(Capability::CtxSetCipherSuites) {
                runtime.ctx_set_ciphersuites(ctx, suites)?;
            } else {
                debug!("runtime has no TLS 1.3 suites; ignoring ciphersuites={suites}");
            }
        }

        Ok(())
    }
}

impl Drop for SecureContext {
    fn drop(&mut self) {
        // Safety: `handle` is never touched again after this point.
        let handle = unsafe { ManuallyDrop::take(&mut self.handle) };
        if let Err(err) = self.runtime.ctx_free(handle) {
            warn!("failed to release ssl context: {err}");
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
