//! Version-independent call surface over the resolved capability table.
//!
//! Every method dispatches through the entry point the resolver picked and
//! translates the raw return value into `Result<_, GatewayError>`. Handles
//! returned here are plain owners of library objects; the matching `*_free`
//! method consumes them, so a handle cannot be used after it was released.
//!
//! Constants below mirror the values in the public OpenSSL headers. They have
//! been stable across every release the gateway supports.

use std::ffi::{CStr, CString, c_char, c_int, c_long, c_ulong, c_void};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::path::Path;
use std::ptr::{self, NonNull};

use tracing::{debug, trace};

use super::capability::{Capability, CapabilityTable};
use super::locator::LoadedModule;
use crate::errors::{GatewayError, Want};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const OPENSSL_VERSION: c_int = 0;

const OPENSSL_INIT_LOAD_CRYPTO_STRINGS: u64 = 0x0000_0002;
const OPENSSL_INIT_LOAD_SSL_STRINGS: u64 = 0x0020_0000;

const SSL_FILETYPE_PEM: c_int = 1;

const SSL_CTRL_OPTIONS: c_int = 32;
const SSL_CTRL_SET_TLSEXT_HOSTNAME: c_int = 55;
const TLSEXT_NAMETYPE_HOST_NAME: c_long = 0;

const BIO_C_SET_CONNECT: c_int = 100;
const BIO_C_SET_NBIO: c_int = 102;
const BIO_C_GET_FD: c_int = 105;
const BIO_C_GET_SSL: c_int = 110;

const SSL_NOTHING: c_int = 1;
const SSL_WRITING: c_int = 2;
const SSL_READING: c_int = 3;

pub const SSL_OP_NO_SSLV2: u64 = 0x0100_0000;
pub const SSL_OP_NO_SSLV3: u64 = 0x0200_0000;
pub const SSL_OP_NO_COMPRESSION: u64 = 0x0002_0000;

pub const X509_V_OK: i64 = 0;

/// 3.0.0 widened the option mask to `uint64_t`.
const OPTIONS_64_BIT_SINCE: u64 = 0x3000_0000;

/// Upper bound on queued errors drained before an I/O call.
const MAX_DRAINED_ERRORS: usize = 64;

const ERROR_STRING_LEN: usize = 256;

// -----------------------------------------------------------------------------
// ----- Signatures ------------------------------------------------------------

type VersionFn = unsafe extern "C" fn(c_int) -> *const c_char;
type VersionNumFn = unsafe extern "C" fn() -> c_ulong;
type MethodFn = unsafe extern "C" fn() -> *const c_void;
type InitSslFn = unsafe extern "C" fn(u64, *const c_void) -> c_int;
type LibraryInitFn = unsafe extern "C" fn() -> c_int;
type LoadErrorStringsFn = unsafe extern "C" fn();
type ConfigFn = unsafe extern "C" fn(*const c_char);
type CtxNewFn = unsafe extern "C" fn(*const c_void) -> *mut c_void;
type VerifyCallback = Option<unsafe extern "C" fn(c_int, *mut c_void) -> c_int>;
type CtxSetVerifyFn = unsafe extern "C" fn(*mut c_void, c_int, VerifyCallback);
type CtxSetIntFn = unsafe extern "C" fn(*mut c_void, c_int);
type CtxLoadVerifyLocationsFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> c_int;
type CtxSetStrFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> c_int;
type CtxUseKeyFileFn = unsafe extern "C" fn(*mut c_void, *const c_char, c_int) -> c_int;
type CtxSetOptionsFn = unsafe extern "C" fn(*mut c_void, c_ulong) -> c_ulong;
type CtxSetOptions64Fn = unsafe extern "C" fn(*mut c_void, u64) -> u64;
type CtrlFn = unsafe extern "C" fn(*mut c_void, c_int, c_long, *mut c_void) -> c_long;
type NewFromFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type SetFdFn = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
type ConstLongFn = unsafe extern "C" fn(*const c_void) -> c_long;
type ConstPtrFn = unsafe extern "C" fn(*const c_void) -> *mut c_void;
type ConstIntFn = unsafe extern "C" fn(*const c_void) -> c_int;
type MutIntFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type GetErrorFn = unsafe extern "C" fn(*const c_void, c_int) -> c_int;
type WriteFn = unsafe extern "C" fn(*mut c_void, *const c_void, c_int) -> c_int;
type ReadFn = unsafe extern "C" fn(*mut c_void, *mut c_void, c_int) -> c_int;
type ErrGetErrorFn = unsafe extern "C" fn() -> c_ulong;
type ErrStringFn = unsafe extern "C" fn(c_ulong, *mut c_char, usize);

// -----------------------------------------------------------------------------
// ----- Handles ---------------------------------------------------------------

macro_rules! owned_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq)]
        pub struct $name(NonNull<c_void>);

        // Library objects may move between threads; they are never shared.
        unsafe impl Send for $name {}

        impl $name {
            pub(crate) fn from_raw(ptr: *mut c_void) -> Option<Self> {
                NonNull::new(ptr).map($name)
            }

            pub fn as_ptr(&self) -> *mut c_void {
                self.0.as_ptr()
            }
        }
    };
}

owned_handle!(
    /// `SSL_CTX *`
    CtxHandle
);
owned_handle!(
    /// `SSL *`
    SslHandle
);
owned_handle!(
    /// `BIO *` (ssl connect chain)
    BioHandle
);
owned_handle!(
    /// `X509 *` with a reference the caller must release
    X509Handle
);

/// `const SSL_METHOD *`; static data inside the library.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodHandle(NonNull<c_void>);

unsafe impl Send for MethodHandle {}
unsafe impl Sync for MethodHandle {}

/// Session owned by a BIO chain. Freed together with the chain.
#[derive(Debug)]
pub struct SslRef<'a> {
    handle: SslHandle,
    _bio: PhantomData<&'a BioHandle>,
}

impl Deref for SslRef<'_> {
    type Target = SslHandle;

    fn deref(&self) -> &SslHandle {
        &self.handle
    }
}

// -----------------------------------------------------------------------------
// ----- VerifyMode / SslErrorKind ---------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMode {
    None,
    Peer,
    PeerRequireCertificate,
}

impl VerifyMode {
    fn as_raw(self) -> c_int {
        match self {
            VerifyMode::None => 0,
            VerifyMode::Peer => 1,
            VerifyMode::PeerRequireCertificate => 1 | 2,
        }
    }
}

/// Result of `SSL_get_error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SslErrorKind {
    None,
    Ssl,
    WantRead,
    WantWrite,
    WantX509Lookup,
    Syscall,
    ZeroReturn,
    WantConnect,
    WantAccept,
    Other(c_int),
}

impl SslErrorKind {
    pub fn from_raw(code: c_int) -> Self {
        match code {
            0 => SslErrorKind::None,
            1 => SslErrorKind::Ssl,
            2 => SslErrorKind::WantRead,
            3 => SslErrorKind::WantWrite,
            4 => SslErrorKind::WantX509Lookup,
            5 => SslErrorKind::Syscall,
            6 => SslErrorKind::ZeroReturn,
            7 => SslErrorKind::WantConnect,
            8 => SslErrorKind::WantAccept,
            other => SslErrorKind::Other(other),
        }
    }

    fn describe(self) -> String {
        match self {
            SslErrorKind::Syscall => "socket error or unexpected eof".to_string(),
            SslErrorKind::ZeroReturn => "connection closed by peer".to_string(),
            SslErrorKind::Ssl => "protocol error".to_string(),
            other => format!("ssl error {other:?}"),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SslRuntime ------------------------------------------------------------

/// The loaded runtime. Only exists after initialization succeeded, so holding
/// one is proof that every mandatory capability is resolved.
pub struct SslRuntime {
    table: CapabilityTable,
    modules: Vec<LoadedModule>,
}

impl fmt::Debug for SslRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslRuntime")
            .field("modules", &self.module_paths())
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// ----- SslRuntime: Static ----------------------------------------------------

impl SslRuntime {
    pub(crate) fn new(modules: Vec<LoadedModule>, table: CapabilityTable) -> Self {
        Self { table, modules }
    }
}

// -----------------------------------------------------------------------------
// ----- SslRuntime: Introspection ---------------------------------------------

impl SslRuntime {
    pub fn table(&self) -> &CapabilityTable {
        &self.table
    }

    pub fn is_supported(&self, capability: Capability) -> bool {
        self.table.is_resolved(capability)
    }

    /// 1.0.x: no combined initializer, legacy option bit meanings.
    pub fn is_legacy(&self) -> bool {
        !self.table.is_resolved(Capability::InitSsl)
    }

    pub fn module_paths(&self) -> Vec<&Path> {
        self.modules.iter().map(|m| m.module.path()).collect()
    }

    pub fn version(&self) -> Result<String, GatewayError> {
        let version: VersionFn = self.require(Capability::VersionString)?;
        let text = unsafe { version(OPENSSL_VERSION) };
        if text.is_null() {
            return Ok("unknown".to_string());
        }
        Ok(unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned())
    }

    /// `OPENSSL_VERSION_NUMBER` of the loaded library (`0xMNNFFPPS`).
    pub fn version_number(&self) -> Option<u64> {
        let number = self.optional::<VersionNumFn>(Capability::VersionNumber)?;
        Some(unsafe { number() } as u64)
    }
}

// -----------------------------------------------------------------------------
// ----- SslRuntime: Initialization --------------------------------------------

impl SslRuntime {
    /// One-time library setup. Uses the combined initializer when exported,
    /// otherwise the legacy pair plus `OPENSSL_config(NULL)` when present.
    pub fn init_ssl(&self) -> Result<(), GatewayError> {
        self.clear_errors();
        if let Some(init) = self.optional::<InitSslFn>(Capability::InitSsl) {
            let opts = OPENSSL_INIT_LOAD_SSL_STRINGS | OPENSSL_INIT_LOAD_CRYPTO_STRINGS;
            let ret = unsafe { init(opts, ptr::null()) };
            if ret != 1 {
                return Err(self.failure(Capability::InitSsl, "OPENSSL_init_ssl returned 0"));
            }
            return Ok(());
        }

        let library_init: LibraryInitFn = self.require(Capability::LibraryInit)?;
        let load_error_strings: LoadErrorStringsFn =
            self.require(Capability::LoadErrorStrings)?;

        debug!("combined initializer missing; using legacy initialization");
        unsafe {
            library_init();
            load_error_strings();
        }

        match self.load_config() {
            Ok(()) | Err(GatewayError::Unsupported { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Load the default OpenSSL configuration file.
    pub fn load_config(&self) -> Result<(), GatewayError> {
        let config: ConfigFn = self.require(Capability::OpensslConfig)?;
        unsafe { config(ptr::null()) };
        Ok(())
    }

    pub fn client_method(&self) -> Result<MethodHandle, GatewayError> {
        let method: MethodFn = self.require(Capability::ClientMethod)?;
        let raw = unsafe { method() };
        NonNull::new(raw.cast_mut())
            .map(MethodHandle)
            .ok_or_else(|| self.failure(Capability::ClientMethod, "no client method"))
    }
}

// -----------------------------------------------------------------------------
// ----- SslRuntime: Context ---------------------------------------------------

impl SslRuntime {
    pub fn ctx_new(&self, method: MethodHandle) -> Result<CtxHandle, GatewayError> {
        let ctx_new: CtxNewFn = self.require(Capability::CtxNew)?;
        self.clear_errors();
        let raw = unsafe { ctx_new(method.0.as_ptr()) };
        CtxHandle::from_raw(raw).ok_or_else(|| self.failure(Capability::CtxNew, "SSL_CTX_new failed"))
    }

    pub fn ctx_free(&self, ctx: CtxHandle) -> Result<(), GatewayError> {
        let ctx_free: FreeFn = self.require(Capability::CtxFree)?;
        unsafe { ctx_free(ctx.as_ptr()) };
        Ok(())
    }

    pub fn ctx_set_verify(&self, ctx: &CtxHandle, mode: VerifyMode) -> Result<(), GatewayError> {
        let set_verify: CtxSetVerifyFn = self.require(Capability::CtxSetVerify)?;
        unsafe { set_verify(ctx.as_ptr(), mode.as_raw(), None) };
        Ok(())
    }

    pub fn ctx_set_verify_depth(&self, ctx: &CtxHandle, depth: u32) -> Result<(), GatewayError> {
        let set_depth: CtxSetIntFn = self.require(Capability::CtxSetVerifyDepth)?;
        let depth = c_int::try_from(depth).unwrap_or(c_int::MAX);
        unsafe { set_depth(ctx.as_ptr(), depth) };
        Ok(())
    }

    pub fn ctx_load_verify_locations(
        &self,
        ctx: &CtxHandle,
        ca_file: Option<&Path>,
        ca_path: Option<&Path>,
    ) -> Result<(), GatewayError> {
        let load: CtxLoadVerifyLocationsFn = self.require(Capability::CtxLoadVerifyLocations)?;
        let ca_file = ca_file.map(path_cstring).transpose()?;
        let ca_path = ca_path.map(path_cstring).transpose()?;
        self.clear_errors();

        let ret = unsafe {
            load(
                ctx.as_ptr(),
                ca_file.as_deref().map_or(ptr::null(), CStr::as_ptr),
                ca_path.as_deref().map_or(ptr::null(), CStr::as_ptr),
            )
        };
        self.check_one(Capability::CtxLoadVerifyLocations, ret, "cannot load CA locations")
    }

    pub fn ctx_use_certificate_chain_file(
        &self,
        ctx: &CtxHandle,
        file: &Path,
    ) -> Result<(), GatewayError> {
        let use_chain: CtxSetStrFn = self.require(Capability::CtxUseCertificateChainFile)?;
        let file = path_cstring(file)?;
        self.clear_errors();
        let ret = unsafe { use_chain(ctx.as_ptr(), file.as_ptr()) };
        self.check_one(
            Capability::CtxUseCertificateChainFile,
            ret,
            "cannot load certificate chain",
        )
    }

    /// PEM private key. Older runtimes only offer the RSA-specific entry point.
    pub fn ctx_use_private_key_file(&self, ctx: &CtxHandle, file: &Path) -> Result<(), GatewayError> {
        let use_key: CtxUseKeyFileFn = self.require(Capability::CtxUsePrivateKeyFile)?;
        let file = path_cstring(file)?;
        self.clear_errors();
        let ret = unsafe { use_key(ctx.as_ptr(), file.as_ptr(), SSL_FILETYPE_PEM) };
        self.check_one(Capability::CtxUsePrivateKeyFile, ret, "cannot load private key")
    }

    /// TLS 1.2 and below cipher list.
    pub fn ctx_set_cipher_list(&self, ctx: &CtxHandle, ciphers: &str) -> Result<(), GatewayError> {
        let set: CtxSetStrFn = self.require(Capability::CtxSetCipherList)?;
        let ciphers = str_cstring(ciphers)?;
        self.clear_errors();
        let ret = unsafe { set(ctx.as_ptr(), ciphers.as_ptr()) };
        self.check_one(Capability::CtxSetCipherList, ret, "no usable cipher in list")
    }

    /// TLS 1.3 suites. `Unsupported` before 1.1.1.
    pub fn ctx_set_ciphersuites(&self, ctx: &CtxHandle, suites: &str) -> Result<(), GatewayError> {
        let set: CtxSetStrFn = self.require(Capability::CtxSetCipherSuites)?;
        let suites = str_cstring(suites)?;
        self.clear_errors();
        let ret = unsafe { set(ctx.as_ptr(), suites.as_ptr()) };
        self.check_one(Capability::CtxSetCipherSuites, ret, "no usable TLS 1.3 suite")
    }

    /// Returns the resulting option mask. Falls back to the ctrl command on
    /// runtimes where `SSL_CTX_set_options` is only a header macro. The
    /// exported function takes `unsigned long` on 1.1 and `uint64_t` from 3.0.
    pub fn ctx_set_options(&self, ctx: &CtxHandle, options: u64) -> Result<u64, GatewayError> {
        if self.is_supported(Capability::CtxSetOptions) {
            if self.version_number().is_some_and(|n| n >= OPTIONS_64_BIT_SINCE) {
                let set: CtxSetOptions64Fn = self.require(Capability::CtxSetOptions)?;
                return Ok(unsafe { set(ctx.as_ptr(), options) });
            }

            let set: CtxSetOptionsFn = self.require(Capability::CtxSetOptions)?;
            let options = c_ulong::try_from(options).map_err(|_| {
                GatewayError::invalid(format!("option mask {options:#x} needs a 3.0 runtime"))
            })?;
            return Ok(unsafe { set(ctx.as_ptr(), options) } as u64);
        }

        let ret = self.ctx_ctrl(ctx, SSL_CTRL_OPTIONS, options as c_long, ptr::null_mut())?;
        Ok(ret as u64)
    }

    pub(crate) fn ctx_ctrl(
        &self,
        ctx: &CtxHandle,
        cmd: c_int,
        larg: c_long,
        parg: *mut c_void,
    ) -> Result<c_long, GatewayError> {
        let ctrl: CtrlFn = self.require(Capability::CtxCtrl)?;
        Ok(unsafe { ctrl(ctx.as_ptr(), cmd, larg, parg) })
    }
}

// -----------------------------------------------------------------------------
// ----- SslRuntime: Session ---------------------------------------------------

impl SslRuntime {
    pub fn ssl_new(&self, ctx: &CtxHandle) -> Result<SslHandle, GatewayError> {
        let ssl_new: NewFromFn = self.require(Capability::SslNew)?;
        self.clear_errors();
        let raw = unsafe { ssl_new(ctx.as_ptr()) };
        SslHandle::from_raw(raw).ok_or_else(|| self.failure(Capability::SslNew, "SSL_new failed"))
    }

    pub fn ssl_free(&self, ssl: SslHandle) -> Result<(), GatewayError> {
        let ssl_free: FreeFn = self.require(Capability::SslFree)?;
        unsafe { ssl_free(ssl.as_ptr()) };
        Ok(())
    }

    /// Bind the session to an already connected socket.
    pub fn ssl_set_fd(&self, ssl: &SslHandle, fd: c_int) -> Result<(), GatewayError> {
        let set_fd: SetFdFn = self.require(Capability::SslSetFd)?;
        self.clear_errors();
        let ret = unsafe { set_fd(ssl.as_ptr(), fd) };
        self.check_one(Capability::SslSetFd, ret, "cannot bind socket")
    }

    pub fn ssl_get_fd(&self, ssl: &SslHandle) -> Result<Option<c_int>, GatewayError> {
        let get_fd: ConstIntFn = self.require(Capability::GetFd)?;
        let fd = unsafe { get_fd(ssl.as_ptr()) };
        Ok((fd >= 0).then_some(fd))
    }

    pub fn ssl_set_connect_state(&self, ssl: &SslHandle) -> Result<(), GatewayError> {
        let set_connect_state: FreeFn = self.require(Capability::SetConnectState)?;
        unsafe { set_connect_state(ssl.as_ptr()) };
        Ok(())
    }

    /// SNI host name (`SSL_set_tlsext_host_name`).
    pub fn ssl_set_host_name(&self, ssl: &SslHandle, host: &str) -> Result<(), GatewayError> {
        let host = str_cstring(host)?;
        self.clear_errors();
        let ret = self.ssl_ctrl(
            ssl,
            SSL_CTRL_SET_TLSEXT_HOSTNAME,
            TLSEXT_NAMETYPE_HOST_NAME,
            host.as_ptr().cast_mut().cast(),
        )?;
        self.check_one(Capability::SslCtrl, ret as c_int, "cannot set SNI host name")
    }

    pub(crate) fn ssl_ctrl(
        &self,
        ssl: &SslHandle,
        cmd: c_int,
        larg: c_long,
        parg: *mut c_void,
    ) -> Result<c_long, GatewayError> {
        let ctrl: CtrlFn = self.require(Capability::SslCtrl)?;
        Ok(unsafe { ctrl(ssl.as_ptr(), cmd, larg, parg) })
    }

    /// One handshake step. `WouldBlock` on a non-blocking socket that is not
    /// ready yet; call again once it is.
    pub fn connect(&self, ssl: &SslHandle) -> Result<(), GatewayError> {
        let connect: MutIntFn = self.require(Capability::Connect)?;
        self.clear_errors();

        let ret = unsafe { connect(ssl.as_ptr()) };
        if ret == 1 {
            return Ok(());
        }

        let err = self.io_failure(ssl, Capability::Connect, ret);
        if let GatewayError::WouldBlock(want) = err {
            trace!("handshake waiting for socket to become {}", want.as_str());
        }
        Err(err)
    }

    /// Read decrypted bytes. `Ok(0)` once the peer closed the TLS session.
    pub fn read(&self, ssl: &SslHandle, buf: &mut [u8]) -> Result<usize, GatewayError> {
        let read: ReadFn = self.require(Capability::Read)?;
        if buf.is_empty() {
            return Ok(0);
        }

        self.clear_errors();
        let len = clamp_len(buf.len());
        let ret = unsafe { read(ssl.as_ptr(), buf.as_mut_ptr().cast(), len) };
        if ret > 0 {
            return Ok(ret as usize);
        }

        match self.error_kind(ssl, ret)? {
            SslErrorKind::ZeroReturn => Ok(0),
            kind => Err(self.kind_failure(Capability::Read, kind)),
        }
    }

    /// Encrypt and send. May write fewer bytes than requested.
    pub fn write(&self, ssl: &SslHandle, buf: &[u8]) -> Result<usize, GatewayError> {
        let write: WriteFn = self.require(Capability::Write)?;
        if buf.is_empty() {
            return Ok(0);
        }

        self.clear_errors();
        let len = clamp_len(buf.len());
        let ret = unsafe { write(ssl.as_ptr(), buf.as_ptr().cast(), len) };
        if ret > 0 {
            return Ok(ret as usize);
        }

        Err(self.io_failure(ssl, Capability::Write, ret))
    }

    /// Decrypted bytes buffered inside the session.
    pub fn pending(&self, ssl: &SslHandle) -> Result<usize, GatewayError> {
        let pending: ConstIntFn = self.require(Capability::Pending)?;
        let n = unsafe { pending(ssl.as_ptr()) };
        Ok(n.max(0) as usize)
    }

    pub fn error_kind(&self, ssl: &SslHandle, ret: c_int) -> Result<SslErrorKind, GatewayError> {
        let get_error: GetErrorFn = self.require(Capability::GetError)?;
        Ok(SslErrorKind::from_raw(unsafe { get_error(ssl.as_ptr(), ret) }))
    }

    /// Direction the session is blocked on, if any (`SSL_want`).
    pub fn want(&self, ssl: &SslHandle) -> Result<Option<Want>, GatewayError> {
        let want: ConstIntFn = self.require(Capability::Want)?;
        Ok(match unsafe { want(ssl.as_ptr()) } {
            SSL_READING => Some(Want::Read),
            SSL_WRITING => Some(Want::Write),
            SSL_NOTHING => None,
            _ => None,
        })
    }

    /// `X509_V_OK` (0) when the peer chain verified.
    pub fn verify_result(&self, ssl: &SslHandle) -> Result<i64, GatewayError> {
        let verify_result: ConstLongFn = self.require(Capability::GetVerifyResult)?;
        Ok(unsafe { verify_result(ssl.as_ptr()) } as i64)
    }

    pub fn peer_certificate(&self, ssl: &SslHandle) -> Result<Option<X509Handle>, GatewayError> {
        let get_peer: ConstPtrFn = self.require(Capability::GetPeerCertificate)?;
        let raw = unsafe { get_peer(ssl.as_ptr()) };
        Ok(X509Handle::from_raw(raw))
    }

    pub fn x509_free(&self, cert: X509Handle) -> Result<(), GatewayError> {
        let x509_free: FreeFn = self.require(Capability::X509Free)?;
        unsafe { x509_free(cert.as_ptr()) };
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- SslRuntime: BIO connect chain -----------------------------------------

impl SslRuntime {
    /// BIO chain that opens its own socket on the first handshake step.
    pub fn bio_new_ssl_connect(&self, ctx: &CtxHandle) -> Result<BioHandle, GatewayError> {
        let bio_new: NewFromFn = self.require(Capability::BioNewSslConnect)?;
        self.clear_errors();
        let raw = unsafe { bio_new(ctx.as_ptr()) };
        BioHandle::from_raw(raw)
            .ok_or_else(|| self.failure(Capability::BioNewSslConnect, "BIO_new_ssl_connect failed"))
    }

    pub fn bio_free_all(&self, bio: BioHandle) -> Result<(), GatewayError> {
        let free_all: FreeFn = self.require(Capability::BioFreeAll)?;
        unsafe { free_all(bio.as_ptr()) };
        Ok(())
    }

    pub fn bio_get_ssl<'a>(&self, bio: &'a BioHandle) -> Result<SslRef<'a>, GatewayError> {
        let mut raw: *mut c_void = ptr::null_mut();
        let parg = (&mut raw as *mut *mut c_void).cast::<c_void>();
        self.bio_ctrl(bio, BIO_C_GET_SSL, 0, parg)?;

        let handle = SslHandle::from_raw(raw)
            .ok_or_else(|| self.failure(Capability::BioCtrl, "BIO chain has no ssl session"))?;
        Ok(SslRef {
            handle,
            _bio: PhantomData,
        })
    }

    pub fn bio_set_nbio(&self, bio: &BioHandle, non_blocking: bool) -> Result<(), GatewayError> {
        self.bio_ctrl(bio, BIO_C_SET_NBIO, c_long::from(non_blocking), ptr::null_mut())?;
        Ok(())
    }

    /// `host:port` the chain will connect to.
    pub fn bio_set_conn_hostname(&self, bio: &BioHandle, address: &str) -> Result<(), GatewayError> {
        let address = str_cstring(address)?;
        self.clear_errors();
        let ret = self.bio_ctrl(
            bio,
            BIO_C_SET_CONNECT,
            0,
            address.as_ptr().cast_mut().cast(),
        )?;
        self.check_one(Capability::BioCtrl, ret as c_int, "cannot set connect address")
    }

    pub fn bio_get_fd(&self, bio: &BioHandle) -> Result<Option<c_int>, GatewayError> {
        let mut fd: c_int = -1;
        let parg = (&mut fd as *mut c_int).cast::<c_void>();
        let ret = self.bio_ctrl(bio, BIO_C_GET_FD, 0, parg)?;
        Ok((ret >= 0 && fd >= 0).then_some(fd))
    }

    pub(crate) fn bio_ctrl(
        &self,
        bio: &BioHandle,
        cmd: c_int,
        larg: c_long,
        parg: *mut c_void,
    ) -> Result<c_long, GatewayError> {
        let ctrl: CtrlFn = self.require(Capability::BioCtrl)?;
        Ok(unsafe { ctrl(bio.as_ptr(), cmd, larg, parg) })
    }
}

// -----------------------------------------------------------------------------
// ----- SslRuntime: Errors ----------------------------------------------------

impl SslRuntime {
    /// Pop the oldest queued library error with its formatted text.
    pub fn last_error(&self) -> Option<(u64, String)> {
        let get_error: ErrGetErrorFn = self.require(Capability::ErrGetError).ok()?;
        let code = unsafe { get_error() };
        if code == 0 {
            return None;
        }
        Some((code as u64, self.error_string(code)))
    }

    fn error_string(&self, code: c_ulong) -> String {
        let Some(format) = self.optional::<ErrStringFn>(Capability::ErrErrorStringN) else {
            return format!("ssl library error {code:#x}");
        };

        let mut buf = [0u8; ERROR_STRING_LEN];
        unsafe { format(code, buf.as_mut_ptr().cast(), ERROR_STRING_LEN - 1) };

        CStr::from_bytes_until_nul(&buf)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|_| format!("ssl library error {code:#x}"))
    }

    fn clear_errors(&self) {
        let Ok(get_error) = self.require::<ErrGetErrorFn>(Capability::ErrGetError) else {
            return;
        };
        for _ in 0..MAX_DRAINED_ERRORS {
            if unsafe { get_error() } == 0 {
                break;
            }
        }
    }

    fn failure(&self, capability: Capability, fallback: &str) -> GatewayError {
        let (code, message) = match self.last_error() {
            Some((code, message)) => (Some(code), message),
            None => (None, fallback.to_string()),
        };
        GatewayError::Transport {
            capability,
            code,
            message,
        }
    }

    fn io_failure(&self, ssl: &SslHandle, capability: Capability, ret: c_int) -> GatewayError {
        match self.error_kind(ssl, ret) {
            Ok(kind) => self.kind_failure(capability, kind),
            Err(err) => err,
        }
    }

    fn kind_failure(&self, capability: Capability, kind: SslErrorKind) -> GatewayError {
        match kind {
            SslErrorKind::WantRead => GatewayError::WouldBlock(Want::Read),
            SslErrorKind::WantWrite => GatewayError::WouldBlock(Want::Write),
            kind => self.failure(capability, &kind.describe()),
        }
    }

    fn check_one(&self, capability: Capability, ret: c_int, fallback: &str) -> Result<(), GatewayError> {
        if ret == 1 {
            Ok(())
        } else {
            Err(self.failure(capability, fallback))
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SslRuntime: Private ---------------------------------------------------

impl SslRuntime {
    fn require<F: Copy>(&self, capability: Capability) -> Result<F, GatewayError> {
        self.optional(capability)
            .ok_or(GatewayError::Unsupported { capability })
    }

    fn optional<F: Copy>(&self, capability: Capability) -> Option<F> {
        // Safety: each call site names the signature paired with `capability`
        // in the Signatures section above.
        self.table
            .get(capability)
            .map(|symbol| unsafe { symbol.cast::<F>() })
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

/// I/O calls take an `int` length; larger buffers are transferred in part.
fn clamp_len(len: usize) -> c_int {
    c_int::try_from(len).unwrap_or(c_int::MAX)
}

fn str_cstring(value: &str) -> Result<CString, GatewayError> {
    CString::new(value).map_err(|_| GatewayError::invalid(format!("{value:?} contains a NUL byte")))
}

/// The library takes file names as raw bytes, so Unix paths pass through
/// unchanged. Elsewhere the path must be valid UTF-8.
#[cfg(unix)]
fn path_cstring(path: &Path) -> Result<CString, GatewayError> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| GatewayError::invalid(format!("{} contains a NUL byte", path.display())))
}

#[cfg(not(unix))]
fn path_cstring(path: &Path) -> Result<CString, GatewayError> {
    let text = path
        .to_str()
        .ok_or_else(|| GatewayError::invalid(format!("{} is not valid UTF-8", path.display())))?;
    str_cstring(text)
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
