use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use super::types::SslMode;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const DEFAULT_VERIFY_DEPTH: u32 = 8;

// -----------------------------------------------------------------------------
// ----- SslSettings -----------------------------------------------------------

/// Connection-level TLS settings.
///
/// ```toml
/// mode = "require"
/// ca_file = "/etc/ssl/certs/ca.pem"
/// cert_file = "client.pem"
/// key_file = "client.key"
/// cipher_list = "HIGH:!aNULL"
/// verify_depth = 4
/// server_name = "db.internal"
/// handshake_timeout = "5s"
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SslSettings {
    pub mode: SslMode,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub cipher_list: Option<String>,
    /// TLS 1.3 suites; ignored on runtimes without TLS 1.3.
    pub ciphersuites: Option<String>,
    pub verify_depth: u32,
    /// Defaults to `true` exactly when `ca_file` is set.
    pub verify_peer: bool,
    /// SNI name. Falls back to the host part of the connect address.
    pub server_name: Option<String>,
    pub handshake_timeout: Option<Duration>,
}

impl Default for SslSettings {
    fn default() -> Self {
        Self {
            mode: SslMode::Disable,
            cert_file: None,
            key_file: None,
            ca_file: None,
            cipher_list: None,
            ciphersuites: None,
            verify_depth: DEFAULT_VERIFY_DEPTH,
            verify_peer: false,
            server_name: None,
            handshake_timeout: None,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SslSettings: Static ---------------------------------------------------

impl SslSettings {
    /// `require` with no verification and no client certificate.
    pub fn require() -> Self {
        Self {
            mode: SslMode::Require,
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<SslSettings, SettingsError> {
        let raw = fs::read_to_string(path).map_err(|e| SettingsError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<SslSettings, SettingsError> {
        let doc: SslSettingsFile =
            toml::from_str(raw).map_err(|e| SettingsError::Toml { source: e })?;

        validate(&doc)?;

        let verify_peer = doc.verify_peer.unwrap_or(doc.ca_file.is_some());

        Ok(SslSettings {
            mode: doc.mode,
            cert_file: doc.cert_file,
            key_file: doc.key_file,
            ca_file: doc.ca_file,
            cipher_list: doc.cipher_list,
            ciphersuites: doc.ciphersuites,
            verify_depth: doc.verify_depth.unwrap_or(DEFAULT_VERIFY_DEPTH),
            verify_peer,
            server_name: doc.server_name,
            handshake_timeout: doc.handshake_timeout,
        })
    }
}

// -----------------------------------------------------------------------------
// ----- SslSettings: Public ---------------------------------------------------

impl SslSettings {
    pub fn is_enabled(&self) -> bool {
        self.mode == SslMode::Require
    }

    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self.verify_peer = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format ----------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SslSettingsFile {
    #[serde(default)]
    mode: SslMode,

    #[serde(default, alias = "cert")]
    cert_file: Option<PathBuf>,

    #[serde(default, alias = "key")]
    key_file: Option<PathBuf>,

    #[serde(default, alias = "ca")]
    ca_file: Option<PathBuf>,

    #[serde(default)]
    cipher_list: Option<String>,

    #[serde(default)]
    ciphersuites: Option<String>,

    #[serde(default)]
    verify_depth: Option<u32>,

    #[serde(default)]
    verify_peer: Option<bool>,

    #[serde(default)]
    server_name: Option<String>,

    #[serde(default, deserialize_with = "de_duration")]
    handshake_timeout: Option<Duration>,
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn validate(doc: &SslSettingsFile) -> Result<(), SettingsError> {
    match (&doc.cert_file, &doc.key_file) {
        (Some(_), None) => return Err(SettingsError::InvalidField("key_file".into())),
        (None, Some(_)) => return Err(SettingsError::InvalidField("cert_file".into())),
        _ => {}
    }
    if doc.verify_peer == Some(true) && doc.ca_file.is_none() {
        return Err(SettingsError::InvalidField("ca_file".into()));
    }
    if doc.verify_depth == Some(0) {
        return Err(SettingsError::InvalidField("verify_depth".into()));
    }
    if doc.server_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(SettingsError::InvalidField("server_name".into()));
    }
    if doc.cipher_list.as_deref().is_some_and(|l| l.contains('\0')) {
        return Err(SettingsError::InvalidField("cipher_list".into()));
    }
    Ok(())
}

/// Accepts a humantime string (`"5s"`, `"1m 30s"`) or integer milliseconds.
fn de_duration<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{Error, Unexpected, Visitor};
    use std::fmt;

    struct OptVisitor;
    struct DurationVisitor;

    impl<'de> Visitor<'de> for OptVisitor {
        type Value = Option<Duration>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration such as \"5s\" or integer milliseconds")
        }
        fn visit_none<E: Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_unit<E: Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_some<D2>(self, d2: D2) -> Result<Self::Value, D2::Error>
        where
            D2: serde::Deserializer<'de>,
        {
            d2.deserialize_any(DurationVisitor)
        }
    }

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Option<Duration>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration such as \"5s\" or integer milliseconds")
        }

        fn visit_u64<E: Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(Duration::from_millis(v)))
        }

        fn visit_i64<E: Error>(self, v: i64) -> Result<Self::Value, E> {
            if v < 0 {
                return Err(E::invalid_value(Unexpected::Signed(v), &self));
            }
            Ok(Some(Duration::from_millis(v as u64)))
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
        }
    }

    d.deserialize_option(OptVisitor)
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid or missing field '{0}'")]
    InvalidField(String),

    #[error("read error for {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("toml parse error: {source}")]
    Toml { source: toml::de::Error },
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
