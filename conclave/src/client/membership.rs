//! Cluster membership glue: seed discovery and connection establishment.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::CoordinationError;
use crate::error::CoordinationResult;
use crate::ProtocolSession;

/// Establishes a session against one cluster address. Implemented by the
/// pluggable transport; the in-memory host ignores the address entirely.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> CoordinationResult<Arc<dyn ProtocolSession>>;
}

/// The seed address book, rotated across connection attempts.
pub struct AddressBook {
    seeds: Vec<String>,
    cursor: AtomicUsize,
}

impl AddressBook {
    pub fn from_seeds(seeds: Vec<String>) -> CoordinationResult<Self> {
        if seeds.is_empty() {
            return Err(CoordinationError::InvalidArgument("cluster.seed must list at least one address".into()));
        }
        Ok(Self {
            seeds,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn all(&self) -> &[String] {
        &self.seeds
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    /// The next seed in round-robin order.
    pub fn next(&self) -> &str {
        let at = self.cursor.fetch_add(1, Ordering::Relaxed) % self.seeds.len();
        &self.seeds[at]
    }
}

/// Client membership glue: walks the seed list until a session comes up and
/// surfaces the session's state stream to the gateway untouched.
pub struct ClusterMembership {
    book: AddressBook,
    connector: Arc<dyn Connector>,
}

impl ClusterMembership {
    pub fn new(config: &Config, connector: Arc<dyn Connector>) -> CoordinationResult<Self> {
        Ok(Self {
            book: AddressBook::from_seeds(config.seeds.clone())?,
            connector,
        })
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.book
    }

    /// Try every seed once, in rotation, and return the first session that
    /// comes up. Transient failures move on to the next seed; anything else
    /// is surfaced immediately.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn connect(&self) -> CoordinationResult<Arc<dyn ProtocolSession>> {
        let mut last_error = None;
        for _ in 0..self.book.len() {
            let address = self.book.next();
            match self.connector.connect(address).await {
                Ok(session) => {
                    tracing::debug!(address, session = session.id(), "connected");
                    return Ok(session);
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(address, error = %err, "seed unreachable, rotating");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| CoordinationError::Unavailable("no seed reachable".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_book_rotates() {
        let book = AddressBook::from_seeds(vec!["a:1".into(), "b:2".into()]).unwrap();
        assert_eq!(book.next(), "a:1");
        assert_eq!(book.next(), "b:2");
        assert_eq!(book.next(), "a:1");
    }

    #[test]
    fn empty_seed_list_is_rejected() {
        assert!(AddressBook::from_seeds(Vec::new()).is_err());
    }
}
