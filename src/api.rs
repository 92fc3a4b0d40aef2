//! Management API access: transports, credentials and the retrying client.

pub mod client;
pub mod credential;
pub mod error;
pub mod http;
pub mod memory;
pub mod pager;
pub mod rate_limit;
pub mod retry;
pub mod transport;

pub use client::{ApiClient, Outcome};
pub use credential::CredentialProvider;
pub use error::ApiError;
pub use memory::MemoryTransport;
pub use transport::Transport;
