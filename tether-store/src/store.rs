//! The blocking-read contract.

use std::time::Duration;

use async_trait::async_trait;
use tether_core::{Dependency, DependencyValue};

use crate::error::StoreError;

/// One successful read: the value and the store version it reflects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub value: DependencyValue,
    pub index: u64,
}

/// A remote key/value store that supports blocking queries.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Read `dependency`, holding the request open until the store version
    /// moves past `since` or `wait` elapses. `since == 0` returns immediately.
    ///
    /// On timeout the current value is returned with an unchanged index; that
    /// is not an error.
    async fn blocking_read(
        &self,
        dependency: &Dependency,
        since: u64,
        wait: Duration,
    ) -> Result<ReadResult, StoreError>;
}
