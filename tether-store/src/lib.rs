//! # tether-store
//!
//! The remote-store contract consumed by the watch engine, plus two
//! implementations:
//!
//! - [`ConsulStore`]: Consul HTTP API blocking queries over `reqwest`
//! - [`MemoryStore`]: in-process store with the same blocking semantics,
//!   failure injection and read accounting

pub mod consul;
pub mod error;
pub mod memory;
pub mod store;

pub use consul::ConsulStore;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use store::{ReadResult, Store};
