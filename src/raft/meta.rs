use std::sync::Arc;

use super::state::PersistentProperties;
use super::{NodeId, Term};
use crate::error::Result;
use crate::storage::MetaStorage;

/// Term and vote bookkeeping, written through to a [`MetaStorage`].
///
/// Not internally synchronized: the node keeps it inside its critical
/// section, so every read-modify-write here is atomic with the RPC handler
/// that triggers it.
pub struct MetaDataManager {
    storage: Arc<dyn MetaStorage>,
    properties: PersistentProperties,
}

impl MetaDataManager {
    pub fn new(storage: Arc<dyn MetaStorage>) -> Self {
        Self {
            storage,
            properties: PersistentProperties::default(),
        }
    }

    /// Load the persisted properties.
    pub async fn init(&mut self) -> Result<()> {
        self.properties = self.storage.read().await?;
        Ok(())
    }

    pub fn term(&self) -> Term {
        self.properties.term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.properties.voted_for
    }

    /// Move from `origin` to `origin + 1` and vote for `candidate`.
    ///
    /// Returns `None` when the term already moved past `origin`: the election
    /// this increment belonged to is stale.
    pub async fn increase_term(&mut self, origin: Term, candidate: NodeId) -> Result<Option<Term>> {
        if self.properties.term != origin {
            return Ok(None);
        }
        let next = PersistentProperties {
            term: origin + 1,
            voted_for: Some(candidate),
        };
        self.persist(next).await?;
        Ok(Some(origin + 1))
    }

    /// Record a vote for `candidate` in `term`.
    ///
    /// Refused when `term` is older than ours, or when we already voted for
    /// someone else in the same term.
    pub async fn vote_for(&mut self, term: Term, candidate: NodeId) -> Result<bool> {
        let current = &self.properties;
        if term < current.term {
            return Ok(false);
        }
        if term == current.term && current.voted_for.is_some_and(|v| v != candidate) {
            return Ok(false);
        }
        self.persist(PersistentProperties {
            term,
            voted_for: Some(candidate),
        })
        .await?;
        Ok(true)
    }

    /// Adopt `term` if it is newer than ours. The vote of the old term is
    /// dropped. Returns whether the term changed.
    pub async fn accept_higher_term(&mut self, term: Term) -> Result<bool> {
        if term <= self.properties.term {
            return Ok(false);
        }
        self.persist(PersistentProperties {
            term,
            voted_for: None,
        })
        .await?;
        Ok(true)
    }

    async fn persist(&mut self, next: PersistentProperties) -> Result<()> {
        self.storage.write(&next).await?;
        self.properties = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryMetaStorage;

    fn manager() -> (MetaDataManager, MemoryMetaStorage) {
        let storage = MemoryMetaStorage::new();
        (MetaDataManager::new(Arc::new(storage.clone())), storage)
    }

    #[tokio::test]
    async fn test_increase_term_is_conditional() {
        let (mut meta, storage) = manager();
        meta.init().await.unwrap();

        assert_eq!(meta.increase_term(0, 1).await.unwrap(), Some(1));
        assert_eq!(meta.voted_for(), Some(1));

        // Stale origin term
        assert_eq!(meta.increase_term(0, 1).await.unwrap(), None);
        assert_eq!(meta.term(), 1);

        let persisted = storage.read().await.unwrap();
        assert_eq!(persisted.term, 1);
        assert_eq!(persisted.voted_for, Some(1));
    }

    #[tokio::test]
    async fn test_one_vote_per_term() {
        let (mut meta, _) = manager();
        assert!(meta.vote_for(3, 2).await.unwrap());
        // Same candidate again is fine
        assert!(meta.vote_for(3, 2).await.unwrap());
        assert!(!meta.vote_for(3, 4).await.unwrap());
        // Older term is refused
        assert!(!meta.vote_for(2, 4).await.unwrap());
        // A newer term gets a fresh vote
        assert!(meta.vote_for(4, 4).await.unwrap());
        assert_eq!(meta.term(), 4);
        assert_eq!(meta.voted_for(), Some(4));
    }

    #[tokio::test]
    async fn test_higher_term_clears_vote() {
        let (mut meta, storage) = manager();
        meta.vote_for(2, 5).await.unwrap();

        assert!(!meta.accept_higher_term(2).await.unwrap());
        assert_eq!(meta.voted_for(), Some(5));

        assert!(meta.accept_higher_term(3).await.unwrap());
        assert_eq!(meta.term(), 3);
        assert_eq!(meta.voted_for(), None);
        assert_eq!(storage.read().await.unwrap().voted_for, None);
    }

    #[tokio::test]
    async fn test_init_restores_persisted_properties() {
        let storage = MemoryMetaStorage::new();
        storage
            .write(&PersistentProperties {
                term: 9,
                voted_for: Some(3),
            })
            .await
            .unwrap();

        let mut meta = MetaDataManager::new(Arc::new(storage));
        meta.init().await.unwrap();
        assert_eq!(meta.term(), 9);
        assert_eq!(meta.voted_for(), Some(3));
    }
}
