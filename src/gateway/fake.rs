//! Simulated runtime installations for unit tests. Entry points are plain
//! `extern "C"` functions; per-thread state records calls and drives the
//! socket readiness and error queue they report.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::ffi::{CStr, c_char, c_int, c_long, c_ulong, c_void};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use super::capability::RawSymbol;
use super::facade::{BioHandle, CtxHandle, SslHandle, SslRuntime};
use super::locator::{CandidateSet, Module, ModuleLoader, locate};
use super::resolver::resolve;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const MODERN_VERSION: &str = "OpenSSL 3.0.99 (simulated)";
pub const LEGACY_VERSION: &str = "OpenSSL 1.0.2zz (simulated)";
pub const MODERN_VERSION_NUMBER: u64 = 0x3000_0630;
pub const LEGACY_VERSION_NUMBER: u64 = 0x1000_21af;

pub const ERR_INIT: u64 = 0x0700_0041;
pub const ERR_NO_CIPHER: u64 = 0x0A00_00B9;
pub const ERR_HANDSHAKE: u64 = 0x0A00_0086;

pub const BOGUS_CIPHERS: &str = "BOGUS";
pub const REJECTING_HOST: &str = "reject.invalid";
pub const BIO_FD: c_int = 7;

const SSL_ERROR_NONE: c_int = 0;
const SSL_ERROR_SSL: c_int = 1;
const SSL_ERROR_WANT_READ: c_int = 2;
const SSL_ERROR_ZERO_RETURN: c_int = 6;

const SSL_NOTHING: c_int = 1;
const SSL_READING: c_int = 3;

static METHOD: u8 = 0;

// -----------------------------------------------------------------------------
// ----- Per-thread state ------------------------------------------------------

thread_local! {
    static CALLS: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
    static ERRORS: RefCell<VecDeque<c_ulong>> = const { RefCell::new(VecDeque::new()) };
    static SOCKET_READY: Cell<bool> = const { Cell::new(true) };
}

pub fn reset() {
    CALLS.with(|c| c.borrow_mut().clear());
    ERRORS.with(|e| e.borrow_mut().clear());
    SOCKET_READY.with(|r| r.set(true));
}

/// Initializer calls seen on this thread, in order.
pub fn calls() -> Vec<&'static str> {
    CALLS.with(|c| c.borrow().clone())
}

pub fn set_socket_ready(ready: bool) {
    SOCKET_READY.with(|r| r.set(ready));
}

fn record(name: &'static str) {
    CALLS.with(|c| c.borrow_mut().push(name));
}

/// Leave an error in the queue, as an earlier failed call would.
pub fn queue_error(code: u64) {
    push_error(code);
}

fn push_error(code: u64) {
    ERRORS.with(|e| e.borrow_mut().push_back(code as c_ulong));
}

// -----------------------------------------------------------------------------
// ----- Simulated objects -----------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct FakeCtx {
    pub options: u64,
    pub verify_mode: c_int,
    pub verify_depth: c_int,
    pub cipher_list: Option<String>,
    pub ciphersuites: Option<String>,
    pub ca_file: Option<String>,
    pub cert_chain: Option<String>,
    pub key_file: Option<String>,
}

#[derive(Debug, Default)]
struct FakeSsl {
    fd: Option<c_int>,
    host: Option<String>,
    connected: bool,
    peer_closed: bool,
    last_error: c_int,
    want: c_int,
    inbox: VecDeque<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct FakeBioState {
    pub non_blocking: bool,
    pub address: Option<String>,
}

struct FakeBio {
    ssl: *mut FakeSsl,
    state: FakeBioState,
}

struct FakeX509;

pub fn ctx_state(ctx: &CtxHandle) -> FakeCtx {
    unsafe { (*ctx.as_ptr().cast::<FakeCtx>()).clone() }
}

pub fn bio_state(bio: &BioHandle) -> FakeBioState {
    unsafe { (*bio.as_ptr().cast::<FakeBio>()).state.clone() }
}

/// Peer sends close_notify.
pub fn close_peer(ssl: &SslHandle) {
    unsafe { (*ssl.as_ptr().cast::<FakeSsl>()).peer_closed = true };
}

unsafe fn ctx<'a>(raw: *mut c_void) -> &'a mut FakeCtx {
    unsafe { &mut *raw.cast::<FakeCtx>() }
}

unsafe fn ssl<'a>(raw: *const c_void) -> &'a mut FakeSsl {
    unsafe { &mut *raw.cast_mut().cast::<FakeSsl>() }
}

unsafe fn text(raw: *const c_char) -> String {
    unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned()
}

// -----------------------------------------------------------------------------
// ----- Entry points: version / init ------------------------------------------

extern "C" fn openssl_version(_kind: c_int) -> *const c_char {
    c"OpenSSL 3.0.99 (simulated)".as_ptr()
}

extern "C" fn ssleay_version(_kind: c_int) -> *const c_char {
    c"OpenSSL 1.0.2zz (simulated)".as_ptr()
}

extern "C" fn openssl_version_num() -> c_ulong {
    MODERN_VERSION_NUMBER as c_ulong
}

extern "C" fn ssleay() -> c_ulong {
    LEGACY_VERSION_NUMBER as c_ulong
}

extern "C" fn client_method() -> *const c_void {
    (&METHOD as *const u8).cast()
}

extern "C" fn openssl_init_ssl(_opts: u64, _settings: *const c_void) -> c_int {
    record("OPENSSL_init_ssl");
    1
}

extern "C" fn openssl_init_ssl_broken(_opts: u64, _settings: *const c_void) -> c_int {
    record("OPENSSL_init_ssl");
    push_error(ERR_INIT);
    0
}

extern "C" fn ssl_library_init() -> c_int {
    record("SSL_library_init");
    1
}

extern "C" fn ssl_load_error_strings() {
    record("SSL_load_error_strings");
}

extern "C" fn openssl_config(_name: *const c_char) {
    record("OPENSSL_config");
}

// -----------------------------------------------------------------------------
// ----- Entry points: context -------------------------------------------------

extern "C" fn ctx_new(_method: *const c_void) -> *mut c_void {
    Box::into_raw(Box::new(FakeCtx::default())).cast()
}

extern "C" fn ctx_free(raw: *mut c_void) {
    drop(unsafe { Box::from_raw(raw.cast::<FakeCtx>()) });
}

extern "C" fn ctx_set_verify(
    raw: *mut c_void,
    mode: c_int,
    _cb: Option<unsafe extern "C" fn(c_int, *mut c_void) -> c_int>,
) {
    unsafe { ctx(raw) }.verify_mode = mode;
}

extern "C" fn ctx_set_verify_depth(raw: *mut c_void, depth: c_int) {
    unsafe { ctx(raw) }.verify_depth = depth;
}

extern "C" fn ctx_load_verify_locations(
    raw: *mut c_void,
    file: *const c_char,
    _path: *const c_char,
) -> c_int {
    if !file.is_null() {
        unsafe { ctx(raw) }.ca_file = Some(unsafe { text(file) });
    }
    1
}

extern "C" fn ctx_use_certificate_chain_file(raw: *mut c_void, file: *const c_char) -> c_int {
    unsafe { ctx(raw) }.cert_chain = Some(unsafe { text(file) });
    1
}

extern "C" fn ctx_use_key_file(raw: *mut c_void, file: *const c_char, _kind: c_int) -> c_int {
    unsafe { ctx(raw) }.key_file = Some(unsafe { text(file) });
    1
}

extern "C" fn ctx_set_cipher_list(raw: *mut c_void, list: *const c_char) -> c_int {
    let list = unsafe { text(list) };
    if list == BOGUS_CIPHERS {
        push_error(ERR_NO_CIPHER);
        return 0;
    }
    unsafe { ctx(raw) }.cipher_list = Some(list);
    1
}

extern "C" fn ctx_set_ciphersuites(raw: *mut c_void, suites: *const c_char) -> c_int {
    unsafe { ctx(raw) }.ciphersuites = Some(unsafe { text(suites) });
    1
}

extern "C" fn ctx_ctrl(raw: *mut c_void, cmd: c_int, larg: c_long, _parg: *mut c_void) -> c_long {
    let ctx = unsafe { ctx(raw) };
    if cmd == 32 {
        ctx.options |= larg as u64;
        return ctx.options as c_long;
    }
    0
}

extern "C" fn ctx_set_options(raw: *mut c_void, options: u64) -> u64 {
    let ctx = unsafe { ctx(raw) };
    ctx.options |= options;
    ctx.options
}

// -----------------------------------------------------------------------------
// ----- Entry points: session -------------------------------------------------

extern "C" fn ssl_new(_ctx: *mut c_void) -> *mut c_void {
    Box::into_raw(Box::new(FakeSsl::default())).cast()
}

extern "C" fn ssl_free(raw: *mut c_void) {
    drop(unsafe { Box::from_raw(raw.cast::<FakeSsl>()) });
}

extern "C" fn ssl_set_fd(raw: *mut c_void, fd: c_int) -> c_int {
    unsafe { ssl(raw) }.fd = Some(fd);
    1
}

extern "C" fn ssl_get_fd(raw: *const c_void) -> c_int {
    unsafe { ssl(raw) }.fd.unwrap_or(-1)
}

extern "C" fn ssl_set_connect_state(_raw: *mut c_void) {}

extern "C" fn ssl_ctrl(raw: *mut c_void, cmd: c_int, _larg: c_long, parg: *mut c_void) -> c_long {
    if cmd == 55 {
        unsafe { ssl(raw) }.host = Some(unsafe { text(parg.cast::<c_char>()) });
        return 1;
    }
    0
}

extern "C" fn ssl_connect(raw: *mut c_void) -> c_int {
    let ssl = unsafe { ssl(raw) };

    if !SOCKET_READY.with(Cell::get) {
        ssl.last_error = SSL_ERROR_WANT_READ;
        ssl.want = SSL_READING;
        return -1;
    }

    if ssl.host.as_deref() == Some(REJECTING_HOST) {
        push_error(ERR_HANDSHAKE);
        ssl.last_error = SSL_ERROR_SSL;
        ssl.want = SSL_NOTHING;
        return -1;
    }

    ssl.connected = true;
    ssl.last_error = SSL_ERROR_NONE;
    ssl.want = SSL_NOTHING;
    1
}

extern "C" fn ssl_get_error(raw: *const c_void, ret: c_int) -> c_int {
    if ret > 0 {
        return SSL_ERROR_NONE;
    }
    unsafe { ssl(raw) }.last_error
}

extern "C" fn ssl_want(raw: *const c_void) -> c_int {
    unsafe { ssl(raw) }.want
}

/// Loopback: written bytes become readable.
extern "C" fn ssl_write(raw: *mut c_void, buf: *const c_void, len: c_int) -> c_int {
    let ssl = unsafe { ssl(raw) };
    let bytes = unsafe { std::slice::from_raw_parts(buf.cast::<u8>(), len as usize) };
    ssl.inbox.extend(bytes);
    len
}

extern "C" fn ssl_read(raw: *mut c_void, buf: *mut c_void, len: c_int) -> c_int {
    let ssl = unsafe { ssl(raw) };

    if ssl.inbox.is_empty() {
        if ssl.peer_closed {
            ssl.last_error = SSL_ERROR_ZERO_RETURN;
            return 0;
        }
        ssl.last_error = SSL_ERROR_WANT_READ;
        ssl.want = SSL_READING;
        return -1;
    }

    let out = unsafe { std::slice::from_raw_parts_mut(buf.cast::<u8>(), len as usize) };
    let n = out.len().min(ssl.inbox.len());
    for (slot, byte) in out.iter_mut().zip(ssl.inbox.drain(..n)) {
        *slot = byte;
    }
    ssl.want = SSL_NOTHING;
    n as c_int
}

extern "C" fn ssl_pending(raw: *const c_void) -> c_int {
    unsafe { ssl(raw) }.inbox.len() as c_int
}

extern "C" fn ssl_get_verify_result(_raw: *const c_void) -> c_long {
    0
}

extern "C" fn ssl_get_peer_certificate(raw: *const c_void) -> *mut c_void {
    if !unsafe { ssl(raw) }.connected {
        return ptr::null_mut();
    }
    Box::into_raw(Box::new(FakeX509)).cast()
}

extern "C" fn x509_free(raw: *mut c_void) {
    drop(unsafe { Box::from_raw(raw.cast::<FakeX509>()) });
}

// -----------------------------------------------------------------------------
// ----- Entry points: BIO / errors --------------------------------------------

extern "C" fn bio_new_ssl_connect(_ctx: *mut c_void) -> *mut c_void {
    let ssl = Box::into_raw(Box::new(FakeSsl::default()));
    let bio = FakeBio {
        ssl,
        state: FakeBioState::default(),
    };
    Box::into_raw(Box::new(bio)).cast()
}

extern "C" fn bio_free_all(raw: *mut c_void) {
    let bio = unsafe { Box::from_raw(raw.cast::<FakeBio>()) };
    drop(unsafe { Box::from_raw(bio.ssl) });
}

extern "C" fn bio_ctrl(raw: *mut c_void, cmd: c_int, larg: c_long, parg: *mut c_void) -> c_long {
    let bio = unsafe { &mut *raw.cast::<FakeBio>() };
    match cmd {
        100 => {
            bio.state.address = Some(unsafe { text(parg.cast::<c_char>()) });
            1
        }
        102 => {
            bio.state.non_blocking = larg != 0;
            1
        }
        105 => {
            if !parg.is_null() {
                unsafe { *parg.cast::<c_int>() = BIO_FD };
            }
            BIO_FD as c_long
        }
        110 => {
            unsafe { *parg.cast::<*mut c_void>() = bio.ssl.cast() };
            1
        }
        _ => 0,
    }
}

extern "C" fn err_get_error() -> c_ulong {
    ERRORS.with(|e| e.borrow_mut().pop_front().unwrap_or(0))
}

extern "C" fn err_error_string_n(code: c_ulong, buf: *mut c_char, len: usize) {
    let message = format!("error:{code:08X}:simulated library:routine");
    let bytes = message.as_bytes();
    let n = bytes.len().min(len.saturating_sub(1));
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), buf.cast::<u8>(), n);
        *buf.add(n) = 0;
    }
}

// -----------------------------------------------------------------------------
// ----- Profiles --------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub enum Profile {
    /// 1.1+/3.x names with the combined initializer.
    Modern,
    /// 1.0.x names with the two-step initializer.
    Legacy,
    /// Nothing loadable.
    Empty,
    /// Modern minus one mandatory name.
    MissingMandatory(&'static str),
    /// Modern minus the listed names.
    Without(&'static [&'static str]),
    /// Modern, but the combined initializer reports failure.
    BrokenInit,
}

fn sym(f: *const ()) -> RawSymbol {
    RawSymbol::new(f.cast_mut().cast()).expect("function address")
}

fn shared_symbols() -> Vec<(&'static str, RawSymbol)> {
    vec![
        ("SSL_CTX_new", sym(ctx_new as *const ())),
        ("SSL_CTX_free", sym(ctx_free as *const ())),
        ("SSL_CTX_set_verify", sym(ctx_set_verify as *const ())),
        ("SSL_CTX_set_verify_depth", sym(ctx_set_verify_depth as *const ())),
        ("SSL_CTX_load_verify_locations", sym(ctx_load_verify_locations as *const ())),
        ("SSL_CTX_use_certificate_chain_file", sym(ctx_use_certificate_chain_file as *const ())),
        ("SSL_CTX_set_cipher_list", sym(ctx_set_cipher_list as *const ())),
        ("SSL_CTX_ctrl", sym(ctx_ctrl as *const ())),
        ("SSL_new", sym(ssl_new as *const ())),
        ("SSL_set_fd", sym(ssl_set_fd as *const ())),
        ("SSL_get_verify_result", sym(ssl_get_verify_result as *const ())),
        ("SSL_ctrl", sym(ssl_ctrl as *const ())),
        ("SSL_set_connect_state", sym(ssl_set_connect_state as *const ())),
        ("SSL_connect", sym(ssl_connect as *const ())),
        ("SSL_get_error", sym(ssl_get_error as *const ())),
        ("SSL_want", sym(ssl_want as *const ())),
        ("SSL_write", sym(ssl_write as *const ())),
        ("SSL_read", sym(ssl_read as *const ())),
        ("SSL_pending", sym(ssl_pending as *const ())),
        ("SSL_get_fd", sym(ssl_get_fd as *const ())),
        ("SSL_free", sym(ssl_free as *const ())),
        ("X509_free", sym(x509_free as *const ())),
        ("BIO_new_ssl_connect", sym(bio_new_ssl_connect as *const ())),
        ("BIO_free_all", sym(bio_free_all as *const ())),
        ("BIO_ctrl", sym(bio_ctrl as *const ())),
        ("ERR_get_error", sym(err_get_error as *const ())),
        ("ERR_error_string_n", sym(err_error_string_n as *const ())),
    ]
}

fn modern_symbols() -> Vec<(&'static str, RawSymbol)> {
    let mut symbols = shared_symbols();
    symbols.extend([
        ("OpenSSL_version", sym(openssl_version as *const ())),
        ("OpenSSL_version_num", sym(openssl_version_num as *const ())),
        ("TLS_client_method", sym(client_method as *const ())),
        ("OPENSSL_init_ssl", sym(openssl_init_ssl as *const ())),
        ("SSL_CTX_set_options", sym(ctx_set_options as *const ())),
        ("SSL_CTX_set_ciphersuites", sym(ctx_set_ciphersuites as *const ())),
        ("SSL_CTX_use_PrivateKey_file", sym(ctx_use_key_file as *const ())),
        ("SSL_get1_peer_certificate", sym(ssl_get_peer_certificate as *const ())),
    ]);
    symbols
}

fn legacy_symbols() -> Vec<(&'static str, RawSymbol)> {
    let mut symbols = shared_symbols();
    symbols.extend([
        ("SSLeay_version", sym(ssleay_version as *const ())),
        ("SSLeay", sym(ssleay as *const ())),
        ("SSLv23_client_method", sym(client_method as *const ())),
        ("SSL_library_init", sym(ssl_library_init as *const ())),
        ("SSL_load_error_strings", sym(ssl_load_error_strings as *const ())),
        ("OPENSSL_config", sym(openssl_config as *const ())),
        ("SSL_CTX_use_RSAPrivateKey_file", sym(ctx_use_key_file as *const ())),
        ("SSL_get_peer_certificate", sym(ssl_get_peer_certificate as *const ())),
    ]);
    symbols
}

impl Profile {
    fn symbols(self) -> Vec<(&'static str, RawSymbol)> {
        let mut symbols = match self {
            Profile::Empty => Vec::new(),
            Profile::Legacy => legacy_symbols(),
            _ => modern_symbols(),
        };

        let removed: Vec<&str> = match self {
            Profile::MissingMandatory(name) => vec![name],
            Profile::Without(names) => names.to_vec(),
            _ => Vec::new(),
        };
        symbols.retain(|(name, _)| !removed.contains(name));

        if let Profile::BrokenInit = self {
            for (name, symbol) in symbols.iter_mut() {
                if *name == "OPENSSL_init_ssl" {
                    *symbol = sym(openssl_init_ssl_broken as *const ());
                }
            }
        }

        symbols
    }
}

fn lives_in_crypto(name: &str) -> bool {
    name.starts_with("ERR_")
        || name.starts_with("X509_")
        || name == "BIO_ctrl"
        || name == "BIO_free_all"
        || name == "OpenSSL_version"
        || name == "SSLeay_version"
        || name == "OpenSSL_version_num"
        || name == "SSLeay"
        || name == "OPENSSL_config"
}

// -----------------------------------------------------------------------------
// ----- FakeModule / FakeLoader -----------------------------------------------

struct FakeModule {
    path: PathBuf,
    symbols: HashMap<&'static str, RawSymbol>,
}

impl Module for FakeModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn symbol(&self, name: &str) -> Option<RawSymbol> {
        self.symbols.get(name).copied()
    }
}

/// Accepts any candidate whose file name starts with `crypto` or `ssl`,
/// except those ending in `-missing`.
pub struct FakeLoader {
    profile: Profile,
    attempts: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl FakeLoader {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            attempts: Arc::new(AtomicUsize::new(0)),
            delay: None,
        }
    }

    /// Sleep inside every load to widen initialization races.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn attempts(&self) -> Arc<AtomicUsize> {
        self.attempts.clone()
    }

    pub fn candidates() -> CandidateSet {
        CandidateSet::new(["crypto-missing", "crypto-b"], ["ssl-missing", "ssl-b"])
    }

    pub fn candidates_len() -> usize {
        4
    }
}

impl ModuleLoader for FakeLoader {
    fn load(&self, candidate: &Path) -> Result<Box<dyn Module>, String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        let name = candidate.to_string_lossy();
        if matches!(self.profile, Profile::Empty) || name.ends_with("-missing") {
            return Err(format!("{name}: cannot open shared object file"));
        }

        let crypto = if name.starts_with("crypto") {
            true
        } else if name.starts_with("ssl") {
            false
        } else {
            return Err(format!("{name}: not a simulated module"));
        };

        let symbols = self
            .profile
            .symbols()
            .into_iter()
            .filter(|(symbol, _)| lives_in_crypto(symbol) == crypto)
            .collect();

        Ok(Box::new(FakeModule {
            path: candidate.to_path_buf(),
            symbols,
        }))
    }
}

/// Resolved runtime for `profile`, without running the initializer.
pub fn runtime(profile: Profile) -> SslRuntime {
    let located = locate(&FakeLoader::new(profile), &FakeLoader::candidates());
    let table = resolve(&located).expect("simulated installation resolves");
    SslRuntime::new(located.modules, table)
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
