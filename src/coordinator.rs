//! Deletion coordinator: cascade rules between documents, vectors, and facts.
//!
//! Document lifecycle is `Active* → Orphaned → Deleted`, with `Deleted`
//! terminal. Document deletion removes the document, removes its vectors,
//! and marks its facts as source-removed, in one SQLite transaction, so a
//! failing middle step rolls back instead of stranding vectors. Session
//! deletion strips memberships and touches nothing else. Facts are deleted
//! only by the full user purge.

use sqlx::SqlitePool;

use crate::errors::EngineError;
use crate::guard;
use crate::store::{DocumentPool, FactStore, VectorIndex};

#[derive(Clone)]
pub struct DeletionCoordinator {
    db: SqlitePool,
    documents: DocumentPool,
    vectors: VectorIndex,
    facts: FactStore,
    guard_enabled: bool,
}

impl DeletionCoordinator {
    pub fn new(
        db: SqlitePool,
        documents: DocumentPool,
        vectors: VectorIndex,
        facts: FactStore,
        guard_enabled: bool,
    ) -> Self {
        Self {
            db,
            documents,
            vectors,
            facts,
            guard_enabled,
        }
    }

    /// Delete one document and run its cascade atomically.
    pub async fn delete_document(&self, doc_id: &str) -> Result<(), EngineError> {
        let owner_id = self
            .documents
            .get(doc_id)
            .await?
            .ok_or_else(|| EngineError::DocumentNotFound(doc_id.to_string()))?
            .owner_id;

        let facts_before = if self.guard_enabled {
            Some(self.facts.list_for_owner(&owner_id).await?)
        } else {
            None
        };

        let mut tx = self.db.begin().await?;
        self.documents.remove_in_tx(&mut tx, doc_id).await?;
        let vectors_removed = self.vectors.remove_for_document_in_tx(&mut tx, doc_id).await?;
        let facts_marked = self.facts.mark_source_removed_in_tx(&mut tx, doc_id).await?;
        tx.commit().await?;

        if let Some(before) = facts_before {
            let after = self.facts.list_for_owner(&owner_id).await?;
            guard::assert_facts_preserved_on_doc_delete(doc_id, &before, &after)?;
        }

        tracing::info!(doc_id, vectors_removed, facts_marked, "document deleted");
        Ok(())
    }

    /// Delete a session: remove it from every membership set. Documents,
    /// vectors, and facts are untouched.
    pub async fn delete_session(&self, session_id: &str) -> Result<u64, EngineError> {
        let stripped = self.documents.remove_session_everywhere(session_id).await?;
        tracing::info!(session_id, stripped, "session deleted");
        Ok(stripped)
    }

    /// Delete every document an owner has; their facts persist with
    /// `source_removed = true`.
    pub async fn delete_all_for_user(&self, owner_id: &str) -> Result<usize, EngineError> {
        let ids = self.documents.list_ids_for_owner(owner_id).await?;
        let deleted = ids.len();
        for id in ids {
            self.delete_document(&id).await?;
        }
        tracing::info!(owner_id, deleted, "all documents deleted for user");
        Ok(deleted)
    }

    /// "Forget everything": documents, vectors, and facts all removed.
    /// The only operation that deletes facts.
    pub async fn purge_user(&self, owner_id: &str) -> Result<(), EngineError> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "DELETE FROM vectors WHERE document_id IN
                (SELECT id FROM documents WHERE owner_id = ?1)",
        )
        .bind(owner_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM chunks WHERE document_id IN
                (SELECT id FROM documents WHERE owner_id = ?1)",
        )
        .bind(owner_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM document_sessions WHERE document_id IN
                (SELECT id FROM documents WHERE owner_id = ?1)",
        )
        .bind(owner_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM documents WHERE owner_id = ?1")
            .bind(owner_id)
            .execute(&mut *tx)
            .await?;
        self.facts.remove_for_owner_in_tx(&mut tx, owner_id).await?;

        tx.commit().await?;
        tracing::info!(owner_id, "user purged");
        Ok(())
    }

    /// Check cross-table consistency. Surfaces vectors stranded by a partial
    /// cascade as `OrphanedVectorsDetected` instead of hiding them.
    pub async fn integrity_scan(&self) -> Result<(), EngineError> {
        let orphaned = self.vectors.orphaned().await?;
        if orphaned.is_empty() {
            return Ok(());
        }

        let vector_count: usize = orphaned.iter().map(|(_, n)| n).sum();
        for (doc_id, count) in &orphaned {
            tracing::error!(doc_id = %doc_id, count = *count, "orphaned vectors for missing document");
        }
        Err(EngineError::OrphanedVectorsDetected {
            document_count: orphaned.len(),
            vector_count,
        })
    }
}
