//! Boundary to the authoritative remote store.
//!
//! The sync core only talks to the server through [`RemoteStore`]. The HTTP
//! implementation maps status codes onto [`RemoteError`]; the in-memory store
//! backs tests and the offline demo.

mod client;
mod memory;
mod retry;
mod types;

pub use client::HttpRemoteStore;
pub use memory::MemoryRemoteStore;
pub use retry::{retry, RetryConfig, Retryable};
pub use types::{RemoteError, RemoteStore, WriteAck};
