//! Key/value persistence seam.

use derive_more::{Debug, Display, Error};
use futures::future::BoxFuture;

/// Error returned by a [`KeyValueStore`].
#[derive(Debug, Display, Error)]
#[display("store error: {_0}")]
#[error(ignore)]
pub struct StoreError(pub String);

impl StoreError {
    /// Create a new store error.
    #[must_use]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Generic string key/value persistence provided by the host application.
///
/// The client only ever stores one blob (the server health records), so the
/// interface is deliberately minimal.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read a value.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>>;

    /// Write a value, replacing any previous one.
    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), StoreError>>;
}
