use crate::types::QueryKey;
use std::fmt::Debug;
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;

/// Error surface of the cache, parameterized over the source's error type.
///
/// Fetch errors stay local to their entry: the same `Arc` handed back here is
/// recorded on the entry for subscribers to read. Mutation errors are
/// reported only after the rollback of all optimistic edits has been applied,
/// so the caller always observes reverted cache state together with the
/// error.
#[derive(Error, Debug)]
pub enum CacheError<E>
where
    E: Debug + Display,
{
    #[error("fetch for '{key}' failed after {attempts} attempt(s): {cause}")]
    Fetch {
        key: QueryKey,
        attempts: u32,
        cause: Arc<E>,
    },

    #[error("mutation failed and was rolled back: {cause}")]
    Mutation { cause: E },

    #[error("no query registered for key '{0}'")]
    Unregistered(QueryKey),

    #[error("cache is closed")]
    Closed,
}

impl<E> CacheError<E>
where
    E: Debug + Display,
{
    /// The source error for fetch and mutation failures.
    pub fn cause(&self) -> Option<&E> {
        match self {
            Self::Fetch { cause, .. } => Some(cause.as_ref()),
            Self::Mutation { cause } => Some(cause),
            Self::Unregistered(_) | Self::Closed => None,
        }
    }
}
