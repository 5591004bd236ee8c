pub mod cli;
pub mod gateway;
pub mod ssl;
pub mod types;

pub use cli::CliConfig;
pub use gateway::GatewayConfig;
pub use ssl::{SettingsError, SslSettings};
pub use types::{LogLevel, SslMode};
