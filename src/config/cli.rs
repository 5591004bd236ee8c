use clap::Parser;
use std::{
    ffi::OsString,
    path::PathBuf,
    sync::OnceLock,
};

use super::gateway::GatewayConfig;
use super::types::LogLevel;

// -----------------------------------------------------------------------------
// ----- Global Singleton ------------------------------------------------------

static CLI_CONFIG: OnceLock<CliConfig> = OnceLock::new();

// -----------------------------------------------------------------------------
// ----- CliConfig -------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CliConfig {
    pub log_level: LogLevel,
    pub openssl_home: Option<PathBuf>,
    pub modules: Vec<PathBuf>,
    pub connect: Option<String>,
    pub settings_file: Option<PathBuf>,
    pub use_bio: bool,
}

impl CliConfig {
    /// Parse process arguments once. clap prints usage and exits on bad input.
    pub fn init() -> &'static CliConfig {
        CLI_CONFIG.get_or_init(|| Self::from_args(Args::parse()))
    }

    pub fn snapshot() -> CliConfig {
        Self::init().clone()
    }

    pub fn try_parse_from<I, T>(args: I) -> Result<CliConfig, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Args::try_parse_from(args).map(Self::from_args)
    }

    /// Environment discovery with the command line layered on top.
    pub fn gateway_config(&self) -> GatewayConfig {
        let mut config = GatewayConfig::from_env();
        if let Some(home) = &self.openssl_home {
            config = config.with_home(home);
        }
        config.extra_candidates.extend(self.modules.iter().cloned());
        config
    }
}

// -----------------------------------------------------------------------------
// ----- CliConfig: Private ----------------------------------------------------

impl CliConfig {
    fn from_args(args: Args) -> Self {
        Self {
            log_level: args.log_level,
            openssl_home: args.openssl_home,
            modules: args.modules,
            connect: args.connect,
            settings_file: args.settings_file,
            use_bio: args.bio,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Args ------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "tlsgate",
    version,
    about = "Probe the installed OpenSSL runtime"
)]
struct Args {
    // Not required via CLI or ENV (defaults to info).
    #[arg(long = "log", default_value = "info")]
    log_level: LogLevel,

    // Directory holding lib64/, lib/ or bin/ with the runtime modules.
    #[arg(long = "openssl-home", env = "TLSGATE_OPENSSL_HOME")]
    openssl_home: Option<PathBuf>,

    // Explicit module files, tried before the system names.
    #[arg(long = "module", value_name = "PATH")]
    modules: Vec<PathBuf>,

    // host:port; performs a handshake when given.
    #[arg(long = "connect", value_name = "HOST:PORT")]
    connect: Option<String>,

    // TOML SslSettings; defaults to `require` without verification.
    #[arg(long = "settings", env = "TLSGATE_SETTINGS_FILE")]
    settings_file: Option<PathBuf>,

    // Let the runtime open the socket itself (BIO connect chain).
    #[arg(long = "bio", requires = "connect")]
    bio: bool,
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
