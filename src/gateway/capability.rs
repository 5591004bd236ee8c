//! Closed set of runtime entry points the gateway knows how to call, with the
//! exported names each one has carried across library releases.

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

// -----------------------------------------------------------------------------
// ----- Requirement -----------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requirement {
    /// Initialization fails when no name variant resolves.
    Mandatory,
    /// May be absent; calls report `Unsupported` or go through a shim.
    Optional,
}

// -----------------------------------------------------------------------------
// ----- Capability ------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    VersionString,
    VersionNumber,
    ClientMethod,
    InitSsl,
    LibraryInit,
    LoadErrorStrings,
    OpensslConfig,
    CtxNew,
    CtxFree,
    CtxSetVerify,
    CtxSetVerifyDepth,
    CtxLoadVerifyLocations,
    CtxUseCertificateChainFile,
    CtxUsePrivateKeyFile,
    CtxSetCipherList,
    CtxSetCipherSuites,
    CtxCtrl,
    CtxSetOptions,
    SslNew,
    SslSetFd,
    GetVerifyResult,
    GetPeerCertificate,
    SslCtrl,
    SetConnectState,
    Connect,
    GetError,
    Want,
    Write,
    Read,
    Pending,
    GetFd,
    SslFree,
    X509Free,
    BioNewSslConnect,
    BioFreeAll,
    BioCtrl,
    ErrGetError,
    ErrErrorStringN,
}

impl Capability {
    pub const COUNT: usize = 38;

    /// Resolution order. Fixed so the same installation always yields the same table.
    pub const ALL: [Capability; Capability::COUNT] = [
        Capability::VersionString,
        Capability::VersionNumber,
        Capability::ClientMethod,
        Capability::InitSsl,
        Capability::LibraryInit,
        Capability::LoadErrorStrings,
        Capability::OpensslConfig,
        Capability::CtxNew,
        Capability::CtxFree,
        Capability::CtxSetVerify,
        Capability::CtxSetVerifyDepth,
        Capability::CtxLoadVerifyLocations,
        Capability::CtxUseCertificateChainFile,
        Capability::CtxUsePrivateKeyFile,
        Capability::CtxSetCipherList,
        Capability::CtxSetCipherSuites,
        Capability::CtxCtrl,
        Capability::CtxSetOptions,
        Capability::SslNew,
        Capability::SslSetFd,
        Capability::GetVerifyResult,
        Capability::GetPeerCertificate,
        Capability::SslCtrl,
        Capability::SetConnectState,
        Capability::Connect,
        Capability::GetError,
        Capability::Want,
        Capability::Write,
        Capability::Read,
        Capability::Pending,
        Capability::GetFd,
        Capability::SslFree,
        Capability::X509Free,
        Capability::BioNewSslConnect,
        Capability::BioFreeAll,
        Capability::BioCtrl,
        Capability::ErrGetError,
        Capability::ErrErrorStringN,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Exported names to try, newest first. Every variant in one list shares
    /// the same C signature; entry points whose signature changed between
    /// releases are separate capabilities tied together by a [`Feature`].
    pub const fn names(self) -> &'static [&'static str] {
        match self {
            Capability::VersionString => &["OpenSSL_version", "SSLeay_version"],
            Capability::VersionNumber => &["OpenSSL_version_num", "SSLeay"],
            Capability::ClientMethod => &["TLS_client_method", "SSLv23_client_method"],
            Capability::InitSsl => &["OPENSSL_init_ssl"],
            Capability::LibraryInit => &["SSL_library_init"],
            Capability::LoadErrorStrings => &["SSL_load_error_strings"],
            Capability::OpensslConfig => &["OPENSSL_config"],
            Capability::CtxNew => &["SSL_CTX_new"],
            Capability::CtxFree => &["SSL_CTX_free"],
            Capability::CtxSetVerify => &["SSL_CTX_set_verify"],
            Capability::CtxSetVerifyDepth => &["SSL_CTX_set_verify_depth"],
            Capability::CtxLoadVerifyLocations => &["SSL_CTX_load_verify_locations"],
            Capability::CtxUseCertificateChainFile => &["SSL_CTX_use_certificate_chain_file"],
            Capability::CtxUsePrivateKeyFile => {
                &["SSL_CTX_use_PrivateKey_file", "SSL_CTX_use_RSAPrivateKey_file"]
            }
            Capability::CtxSetCipherList => &["SSL_CTX_set_cipher_list"],
            Capability::CtxSetCipherSuites => &["SSL_CTX_set_ciphersuites"],
            Capability::CtxCtrl => &["SSL_CTX_ctrl"],
            // Argument width follows the runtime version, see `SslRuntime::ctx_set_options`.
            Capability::CtxSetOptions => &["SSL_CTX_set_options"],
            Capability::SslNew => &["SSL_new"],
            Capability::SslSetFd => &["SSL_set_fd"],
            Capability::GetVerifyResult => &["SSL_get_verify_result"],
            Capability::GetPeerCertificate => {
                &["SSL_get1_peer_certificate", "SSL_get_peer_certificate"]
            }
            Capability::SslCtrl => &["SSL_ctrl"],
            Capability::SetConnectState => &["SSL_set_connect_state"],
            Capability::Connect => &["SSL_connect"],
            Capability::GetError => &["SSL_get_error"],
            Capability::Want => &["SSL_want"],
            Capability::Write => &["SSL_write"],
            Capability::Read => &["SSL_read"],
            Capability::Pending => &["SSL_pending"],
            Capability::GetFd => &["SSL_get_fd"],
            Capability::SslFree => &["SSL_free"],
            Capability::X509Free => &["X509_free"],
            Capability::BioNewSslConnect => &["BIO_new_ssl_connect"],
            Capability::BioFreeAll => &["BIO_free_all"],
            Capability::BioCtrl => &["BIO_ctrl"],
            Capability::ErrGetError => &["ERR_get_error"],
            Capability::ErrErrorStringN => &["ERR_error_string_n"],
        }
    }

    pub const fn requirement(self) -> Requirement {
        match self {
            Capability::VersionNumber
            | Capability::InitSsl
            | Capability::LibraryInit
            | Capability::LoadErrorStrings
            | Capability::OpensslConfig
            | Capability::CtxSetCipherSuites
            | Capability::CtxSetOptions
            | Capability::ErrErrorStringN => Requirement::Optional,
            _ => Requirement::Mandatory,
        }
    }

    pub const fn is_optional(self) -> bool {
        matches!(self.requirement(), Requirement::Optional)
    }

    /// Canonical (newest) exported name.
    pub const fn as_str(self) -> &'static str {
        self.names()[0]
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------------------------------------------------------------
// ----- Feature ---------------------------------------------------------------

/// Optional capabilities that only make sense together. A feature is usable
/// when at least one alternative has every member resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    RuntimeInit,
}

impl Feature {
    pub const ALL: [Feature; 1] = [Feature::RuntimeInit];

    pub const fn alternatives(self) -> &'static [&'static [Capability]] {
        match self {
            Feature::RuntimeInit => &[
                &[Capability::InitSsl],
                &[Capability::LibraryInit, Capability::LoadErrorStrings],
            ],
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Feature::RuntimeInit => "runtime initialization",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------------------------------------------------------------
// ----- RawSymbol -------------------------------------------------------------

/// Address of a resolved entry point. Only meaningful while the module that
/// exported it stays loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawSymbol(NonNull<c_void>);

// Function addresses are process-wide and immutable once resolved.
unsafe impl Send for RawSymbol {}
unsafe impl Sync for RawSymbol {}

impl RawSymbol {
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(RawSymbol)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Reinterpret as a typed function pointer.
    ///
    /// # Safety
    /// `F` must be a function pointer type matching the exported signature.
    pub(crate) unsafe fn cast<F: Copy>(self) -> F {
        debug_assert_eq!(size_of::<F>(), size_of::<*mut c_void>());
        unsafe { std::mem::transmute_copy::<*mut c_void, F>(&self.0.as_ptr()) }
    }
}

// -----------------------------------------------------------------------------
// ----- CapabilityTable -------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Resolved {
        symbol: RawSymbol,
        name: &'static str,
        module: usize,
    },
    Absent,
}

/// Capability -> resolved entry point. Built once by the resolver, read-only afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilityTable {
    slots: [Slot; Capability::COUNT],
}

impl CapabilityTable {
    pub(crate) fn empty() -> Self {
        Self {
            slots: [Slot::Absent; Capability::COUNT],
        }
    }

    pub(crate) fn set(&mut self, capability: Capability, slot: Slot) {
        self.slots[capability.index()] = slot;
    }

    pub fn slot(&self, capability: Capability) -> Slot {
        self.slots[capability.index()]
    }

    pub fn get(&self, capability: Capability) -> Option<RawSymbol> {
        match self.slot(capability) {
            Slot::Resolved { symbol, .. } => Some(symbol),
            Slot::Absent => None,
        }
    }

    pub fn is_resolved(&self, capability: Capability) -> bool {
        self.get(capability).is_some()
    }

    /// Which name variant won, if any.
    pub fn resolved_name(&self, capability: Capability) -> Option<&'static str> {
        match self.slot(capability) {
            Slot::Resolved { name, .. } => Some(name),
            Slot::Absent => None,
        }
    }

    pub fn unresolved(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL
            .into_iter()
            .filter(|capability| !self.is_resolved(*capability))
    }

    pub fn feature_available(&self, feature: Feature) -> bool {
        feature
            .alternatives()
            .iter()
            .any(|group| group.iter().all(|capability| self.is_resolved(*capability)))
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
