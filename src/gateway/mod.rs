//! Runtime binding to the system OpenSSL: find the modules, resolve the
//! entry points once, and expose them through a version-independent facade.

pub mod capability;
pub mod facade;
pub mod lifecycle;
pub mod locator;
pub mod resolver;

#[cfg(test)]
pub(crate) mod fake;

pub use capability::{Capability, CapabilityTable, Feature, Requirement};
pub use facade::{SslErrorKind, SslRuntime, VerifyMode};
pub use lifecycle::{InitState, SslGateway};
pub use locator::{CandidateSet, Module, ModuleLoader, SystemLoader};
