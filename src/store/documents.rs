//! Document pool: per-user document collection with session membership.
//!
//! A document belongs to exactly one owner and is visible to the sessions in
//! its `active_sessions` set. A document whose set is empty is orphaned:
//! still owned and listed, but not retrievable. The retrieval filter is
//! membership, never `origin_session_id`; that single rule is what keeps
//! sessions from leaking into each other.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::chunker::TextChunk;
use crate::errors::EngineError;
use crate::guard::{self, FilterField, PoolOperation};
use crate::store::now_iso;

/// Content metadata supplied at upload. Well-known fields are typed; anything
/// else rides in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub filename: String,
    pub size_bytes: i64,
    pub mime_type: String,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub origin_session_id: String,
    pub meta: DocumentMeta,
    pub active_sessions: HashSet<String>,
    pub chunk_count: usize,
    pub access_count: i64,
    pub last_accessed_at: String,
}

impl Document {
    /// Owned but not retrievable by any session.
    pub fn is_orphaned(&self) -> bool {
        self.active_sessions.is_empty()
    }
}

/// One stored chunk row, ordered by `chunk_index` within its document.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub token_estimate: i64,
}

#[derive(Clone)]
pub struct DocumentPool {
    pool: SqlitePool,
    capacity: usize,
}

impl DocumentPool {
    pub fn new(pool: SqlitePool, capacity: usize) -> Self {
        Self { pool, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn count_for_owner(&self, owner_id: &str) -> Result<usize, EngineError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE owner_id = ?1")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Reject an upload once the owner's pool is at capacity.
    pub async fn check_capacity(&self, owner_id: &str) -> Result<(), EngineError> {
        let count = self.count_for_owner(owner_id).await?;
        if guard::assert_pool_limit(count, self.capacity, PoolOperation::Upload).is_err() {
            return Err(EngineError::CapacityExceeded {
                count,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Create a document with its chunk rows inside an open transaction.
    ///
    /// `active_sessions` starts as `{origin_session_id}`. The caller commits
    /// after inserting the matching vector records.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        owner_id: &str,
        origin_session_id: &str,
        meta: &DocumentMeta,
        chunks: &[TextChunk],
    ) -> Result<String, EngineError> {
        let id = uuid::Uuid::new_v4().to_string();
        let extra = serde_json::to_string(&meta.extra).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            "INSERT INTO documents
                (id, owner_id, origin_session_id, filename, size_bytes, mime_type, extra, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(origin_session_id)
        .bind(&meta.filename)
        .bind(meta.size_bytes)
        .bind(&meta.mime_type)
        .bind(extra)
        .bind(now_iso())
        .execute(&mut **tx)
        .await?;

        sqlx::query("INSERT INTO document_sessions (document_id, session_id) VALUES (?1, ?2)")
            .bind(&id)
            .bind(origin_session_id)
            .execute(&mut **tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (document_id, chunk_index, text, token_estimate)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&id)
            .bind(chunk.chunk_index as i64)
            .bind(&chunk.text)
            .bind(chunk.token_estimate as i64)
            .execute(&mut **tx)
            .await?;
        }

        Ok(id)
    }

    /// Pull a document into a session.
    ///
    /// Any session of the owning user may activate any of that user's
    /// documents, but cross-owner activation is rejected. No-op (no access
    /// bookkeeping) when the membership already exists.
    pub async fn activate(
        &self,
        doc_id: &str,
        session_id: &str,
        owner_id: &str,
    ) -> Result<(), EngineError> {
        // Existence check and membership insert share one transaction, so a
        // concurrent document deletion can never leave a membership row for a
        // document that is already gone.
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT owner_id FROM documents WHERE id = ?1")
            .bind(doc_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::DocumentNotFound(doc_id.to_string()))?;

        let doc_owner: String = row.get("owner_id");
        if doc_owner != owner_id {
            return Err(EngineError::NotOwner {
                doc_id: doc_id.to_string(),
                owner_id: owner_id.to_string(),
            });
        }

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO document_sessions (document_id, session_id) VALUES (?1, ?2)",
        )
        .bind(doc_id)
        .bind(session_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted > 0 {
            sqlx::query(
                "UPDATE documents SET access_count = access_count + 1, last_accessed_at = ?2
                 WHERE id = ?1",
            )
            .bind(doc_id)
            .bind(now_iso())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove a session from a document's membership. The document stays
    /// listed even when the set becomes empty.
    pub async fn deactivate(&self, doc_id: &str, session_id: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM document_sessions WHERE document_id = ?1 AND session_id = ?2")
            .bind(doc_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Documents retrievable by a session: those whose `active_sessions`
    /// contains it. The filter field is declared and asserted so a regression
    /// to origin-based filtering fails fast.
    pub async fn active_for(&self, session_id: &str) -> Result<Vec<Document>, EngineError> {
        guard::assert_active_session_filter(FilterField::ActiveSessions)?;

        let rows = sqlx::query(
            "SELECT d.id, d.owner_id, d.origin_session_id, d.filename, d.size_bytes,
                    d.mime_type, d.extra, d.access_count, d.last_accessed_at
             FROM documents d
             JOIN document_sessions ds ON ds.document_id = d.id
             WHERE ds.session_id = ?1
             ORDER BY d.created_at",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            documents.push(self.hydrate(row, &id).await?);
        }
        Ok(documents)
    }

    pub async fn get(&self, doc_id: &str) -> Result<Option<Document>, EngineError> {
        let row = sqlx::query(
            "SELECT id, owner_id, origin_session_id, filename, size_bytes,
                    mime_type, extra, access_count, last_accessed_at
             FROM documents WHERE id = ?1",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row, doc_id).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_ids_for_owner(&self, owner_id: &str) -> Result<Vec<String>, EngineError> {
        let rows =
            sqlx::query("SELECT id FROM documents WHERE owner_id = ?1 ORDER BY created_at")
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    /// Chunk rows for a set of documents, in document + chunk order.
    pub async fn chunks_for(&self, doc_ids: &[String]) -> Result<Vec<StoredChunk>, EngineError> {
        if doc_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; doc_ids.len()].join(", ");
        let sql = format!(
            "SELECT document_id, chunk_index, text, token_estimate FROM chunks
             WHERE document_id IN ({placeholders})
             ORDER BY document_id, chunk_index"
        );

        let mut query = sqlx::query(&sql);
        for id in doc_ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| StoredChunk {
                document_id: row.get("document_id"),
                chunk_index: row.get("chunk_index"),
                text: row.get("text"),
                token_estimate: row.get("token_estimate"),
            })
            .collect())
    }

    pub async fn chunk_text(
        &self,
        doc_id: &str,
        chunk_index: i64,
    ) -> Result<Option<String>, EngineError> {
        let row =
            sqlx::query("SELECT text FROM chunks WHERE document_id = ?1 AND chunk_index = ?2")
                .bind(doc_id)
                .bind(chunk_index)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.get("text")))
    }

    /// Remove the document row, its chunks, and its memberships. Runs inside
    /// the coordinator's cascade transaction only.
    pub async fn remove_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        doc_id: &str,
    ) -> Result<(), EngineError> {
        let removed = sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(doc_id)
            .execute(&mut **tx)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(EngineError::DocumentNotFound(doc_id.to_string()));
        }

        sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(doc_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM document_sessions WHERE document_id = ?1")
            .bind(doc_id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    /// Owners whose documents hold a membership for this session, in a
    /// stable order so callers can take per-owner locks without deadlocking.
    pub async fn owners_for_session(&self, session_id: &str) -> Result<Vec<String>, EngineError> {
        let rows = sqlx::query(
            "SELECT DISTINCT d.owner_id FROM documents d
             JOIN document_sessions ds ON ds.document_id = d.id
             WHERE ds.session_id = ?1
             ORDER BY d.owner_id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("owner_id")).collect())
    }

    /// Strip a session from every membership set. Documents stay untouched.
    pub async fn remove_session_everywhere(&self, session_id: &str) -> Result<u64, EngineError> {
        let removed = sqlx::query("DELETE FROM document_sessions WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    async fn hydrate(&self, row: sqlx::sqlite::SqliteRow, doc_id: &str) -> Result<Document, EngineError> {
        let session_rows =
            sqlx::query("SELECT session_id FROM document_sessions WHERE document_id = ?1")
                .bind(doc_id)
                .fetch_all(&self.pool)
                .await?;
        let active_sessions: HashSet<String> = session_rows
            .into_iter()
            .map(|r| r.get("session_id"))
            .collect();

        let chunk_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?1")
                .bind(doc_id)
                .fetch_one(&self.pool)
                .await?;

        let extra_raw: String = row.get("extra");
        let extra = serde_json::from_str(&extra_raw).unwrap_or(serde_json::Value::Null);

        Ok(Document {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            origin_session_id: row.get("origin_session_id"),
            meta: DocumentMeta {
                filename: row.get("filename"),
                size_bytes: row.get("size_bytes"),
                mime_type: row.get("mime_type"),
                extra,
            },
            active_sessions,
            chunk_count: chunk_count as usize,
            access_count: row.get("access_count"),
            last_accessed_at: row.get("last_accessed_at"),
        })
    }
}
