//! Connection-layer TLS built on the runtime facade: owned context, session
//! and certificate handles, the BIO connect path, and the async stream.

pub mod bio;
pub mod context;
pub mod session;
pub mod stream;

pub use bio::BioConnection;
pub use context::{BASELINE_OPTIONS, SecureContext, baseline_options};
pub use session::{PeerCertificate, SslSession};
pub use stream::{SecureStream, StreamError, server_name_for};
