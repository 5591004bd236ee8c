pub mod config;
pub mod errors;
pub mod gateway;
pub mod tls;

pub use config::{GatewayConfig, SslSettings};
pub use errors::{GatewayError, LoadFailure, Want};
pub use gateway::{Capability, SslGateway, SslRuntime};
pub use tls::{SecureContext, SecureStream};
