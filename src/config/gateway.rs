use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const HOME_ENV: &str = "TLSGATE_OPENSSL_HOME";
pub const FALLBACK_HOME_ENV: &str = "OPENSSL_HOME";
pub const MODULES_ENV: &str = "TLSGATE_OPENSSL_MODULES";

// -----------------------------------------------------------------------------
// ----- GatewayConfig ---------------------------------------------------------

/// Where to look for the runtime modules before the system search path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewayConfig {
    pub openssl_home: Option<PathBuf>,
    /// Explicit module files; sorted into crypto or tls by file name.
    pub extra_candidates: Vec<PathBuf>,
}

// -----------------------------------------------------------------------------
// ----- GatewayConfig: Static -------------------------------------------------

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var_os(key))
    }

    /// `TLSGATE_OPENSSL_HOME` wins over `OPENSSL_HOME`. `TLSGATE_OPENSSL_MODULES`
    /// is a platform path list (`:` on Unix, `;` on Windows).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let openssl_home = [HOME_ENV, FALLBACK_HOME_ENV]
            .into_iter()
            .filter_map(&lookup)
            .find(|value| !value.is_empty())
            .map(PathBuf::from);

        let extra_candidates = lookup(MODULES_ENV)
            .map(|raw| env::split_paths(&raw).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default();

        Self {
            openssl_home,
            extra_candidates,
        }
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.openssl_home = Some(home.into());
        self
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
