//! Finds and loads the cryptography runtime modules for the current platform.

use std::ffi::{CString, OsStr, c_void};
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use tracing::{debug, info};

use super::capability::RawSymbol;
use crate::config::GatewayConfig;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

#[cfg(all(windows, target_pointer_width = "64"))]
const CRYPTO_NAMES: &[&str] = &["libcrypto-3-x64.dll", "libcrypto-1_1-x64.dll", "libeay32.dll"];
#[cfg(all(windows, target_pointer_width = "64"))]
const TLS_NAMES: &[&str] = &["libssl-3-x64.dll", "libssl-1_1-x64.dll", "ssleay32.dll"];

#[cfg(all(windows, not(target_pointer_width = "64")))]
const CRYPTO_NAMES: &[&str] = &["libcrypto-3.dll", "libcrypto-1_1.dll", "libeay32.dll"];
#[cfg(all(windows, not(target_pointer_width = "64")))]
const TLS_NAMES: &[&str] = &["libssl-3.dll", "libssl-1_1.dll", "ssleay32.dll"];

#[cfg(target_os = "macos")]
const CRYPTO_NAMES: &[&str] = &["libcrypto.3.dylib", "libcrypto.1.1.dylib", "libcrypto.dylib"];
#[cfg(target_os = "macos")]
const TLS_NAMES: &[&str] = &["libssl.3.dylib", "libssl.1.1.dylib", "libssl.dylib"];

#[cfg(not(any(windows, target_os = "macos")))]
const CRYPTO_NAMES: &[&str] = &[
    "libcrypto.so.3",
    "libcrypto.so.1.1",
    "libcrypto.so.1.0.0",
    "libcrypto.so",
];
#[cfg(not(any(windows, target_os = "macos")))]
const TLS_NAMES: &[&str] = &["libssl.so.3", "libssl.so.1.1", "libssl.so.1.0.0", "libssl.so"];

/// Subdirectories of an OpenSSL home that may hold the shared libraries.
const HOME_SUBDIRS: &[&str] = &["lib64", "lib", "bin"];

// -----------------------------------------------------------------------------
// ----- Engine ----------------------------------------------------------------

/// Logical module. One winner per engine; crypto is searched before tls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engine {
    Crypto,
    Tls,
}

impl Engine {
    pub const ALL: [Engine; 2] = [Engine::Crypto, Engine::Tls];

    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Crypto => "crypto",
            Engine::Tls => "tls",
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Module / ModuleLoader -------------------------------------------------

/// A loaded shared library that can be asked for exported symbols.
pub trait Module: Send + Sync {
    fn path(&self) -> &Path;

    fn symbol(&self, name: &str) -> Option<RawSymbol>;
}

/// Platform dynamic-loading primitive.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, candidate: &Path) -> Result<Box<dyn Module>, String>;
}

// -----------------------------------------------------------------------------
// ----- CandidateSet ----------------------------------------------------------

/// Ordered file names (or full paths) to try per engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateSet {
    crypto: Vec<PathBuf>,
    tls: Vec<PathBuf>,
}

impl CandidateSet {
    pub fn new<I, J>(crypto: I, tls: J) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PathBuf>,
        J: IntoIterator,
        J::Item: Into<PathBuf>,
    {
        Self {
            crypto: crypto.into_iter().map(Into::into).collect(),
            tls: tls.into_iter().map(Into::into).collect(),
        }
    }

    /// Bare platform names, resolved through the system loader search path.
    pub fn system() -> Self {
        Self::new(CRYPTO_NAMES.iter().copied(), TLS_NAMES.iter().copied())
    }

    /// Files under the configured OpenSSL home come first, then system names.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut crypto = Vec::new();
        let mut tls = Vec::new();

        if let Some(home) = config.openssl_home.as_deref() {
            push_home_candidates(&mut crypto, home, CRYPTO_NAMES);
            push_home_candidates(&mut tls, home, TLS_NAMES);
        }

        for extra in &config.extra_candidates {
            match classify(extra) {
                Some(Engine::Crypto) => crypto.push(extra.clone()),
                Some(Engine::Tls) => tls.push(extra.clone()),
                None => debug!("ignoring unrecognized module candidate {}", extra.display()),
            }
        }

        crypto.extend(CRYPTO_NAMES.iter().map(PathBuf::from));
        tls.extend(TLS_NAMES.iter().map(PathBuf::from));

        Self { crypto, tls }
    }

    pub fn for_engine(&self, engine: Engine) -> &[PathBuf] {
        match engine {
            Engine::Crypto => &self.crypto,
            Engine::Tls => &self.tls,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Located ---------------------------------------------------------------

pub struct LoadedModule {
    pub engine: Engine,
    pub module: Box<dyn Module>,
}

/// Outcome of one locate pass: the winners plus everything that was tried.
pub struct Located {
    pub modules: Vec<LoadedModule>,
    pub tried: Vec<String>,
}

/// Try every candidate in priority order; first successful load per engine wins.
/// Failed candidates are expected and dropped silently.
pub fn locate(loader: &dyn ModuleLoader, candidates: &CandidateSet) -> Located {
    let mut modules = Vec::with_capacity(Engine::ALL.len());
    let mut tried = Vec::new();

    for engine in Engine::ALL {
        for candidate in candidates.for_engine(engine) {
            tried.push(candidate.display().to_string());

            match loader.load(candidate) {
                Ok(module) => {
                    info!(
                        "loaded {} module {}",
                        engine.as_str(),
                        module.path().display()
                    );
                    modules.push(LoadedModule { engine, module });
                    break;
                }
                Err(err) => {
                    debug!("{} module candidate skipped: {err}", engine.as_str());
                }
            }
        }
    }

    Located { modules, tried }
}

// -----------------------------------------------------------------------------
// ----- SystemLoader ----------------------------------------------------------

/// `libloading`-backed loader.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLoader;

impl ModuleLoader for SystemLoader {
    fn load(&self, candidate: &Path) -> Result<Box<dyn Module>, String> {
        // Safety: loading runs the library's initializers. The candidates are
        // the well-known OpenSSL file names or paths the operator configured.
        let library = unsafe { Library::new(candidate.as_os_str()) }
            .map_err(|e| format!("failed to load '{}': {e}", candidate.display()))?;

        Ok(Box::new(DynamicModule {
            path: candidate.to_path_buf(),
            library,
        }))
    }
}

struct DynamicModule {
    path: PathBuf,
    library: Library,
}

impl Module for DynamicModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn symbol(&self, name: &str) -> Option<RawSymbol> {
        let c_name = CString::new(name).ok()?;

        // Safety: the address is only reinterpreted by the facade, which pairs
        // every capability with its exported signature.
        let symbol: Symbol<*mut c_void> =
            unsafe { self.library.get(c_name.as_bytes_with_nul()) }.ok()?;

        RawSymbol::new(*symbol)
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn push_home_candidates(out: &mut Vec<PathBuf>, home: &Path, names: &[&str]) {
    for subdir in HOME_SUBDIRS {
        for name in names {
            out.push(home.join(subdir).join(name));
        }
    }
    for name in names {
        out.push(home.join(name));
    }
}

fn classify(candidate: &Path) -> Option<Engine> {
    let file_name = candidate.file_name().and_then(OsStr::to_str)?;

    if file_name.contains("crypto") || file_name.starts_with("libeay") {
        Some(Engine::Crypto)
    } else if file_name.contains("ssl") {
        Some(Engine::Tls)
    } else {
        None
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
