//! SQLite persistence layer.
//!
//! One database file holds documents, session memberships, chunks, vector
//! records, and facts. The schema preserves every field of the data model
//! verbatim across restarts. Cascades are driven explicitly by the deletion
//! coordinator, so the tables carry no `ON DELETE` actions: the integrity
//! scan relies on being able to observe an inconsistent state.

pub mod documents;
pub mod facts;
pub mod vectors;

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::errors::EngineError;

pub use documents::{Document, DocumentMeta, DocumentPool, StoredChunk};
pub use facts::{Fact, FactCategory, FactStore, FactValue};
pub use vectors::{ScoredRecord, VectorIndex, VectorRecord};

/// Open (or create) the engine database with the standard pragmas.
pub async fn open_db(db_path: &Path) -> Result<SqlitePool, EngineError> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(4)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    Ok(pool)
}

async fn init_schema(pool: &SqlitePool) -> Result<(), EngineError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            origin_session_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            mime_type TEXT NOT NULL,
            extra TEXT NOT NULL DEFAULT '{}',
            access_count INTEGER NOT NULL DEFAULT 0,
            last_accessed_at TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS document_sessions (
            document_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            PRIMARY KEY (document_id, session_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chunks (
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            token_estimate INTEGER NOT NULL,
            PRIMARY KEY (document_id, chunk_index)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS vectors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            projections BLOB NOT NULL,
            UNIQUE (document_id, chunk_index)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS facts (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            key TEXT NOT NULL,
            category TEXT NOT NULL,
            value TEXT NOT NULL,
            source_document_id TEXT,
            source_removed INTEGER NOT NULL DEFAULT 0,
            confidence REAL NOT NULL DEFAULT 1.0,
            UNIQUE (owner_id, key)
        )",
    )
    .execute(pool)
    .await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner_id)",
        "CREATE INDEX IF NOT EXISTS idx_document_sessions_session ON document_sessions(session_id)",
        "CREATE INDEX IF NOT EXISTS idx_vectors_document ON vectors(document_id)",
        "CREATE INDEX IF NOT EXISTS idx_facts_owner ON facts(owner_id)",
        "CREATE INDEX IF NOT EXISTS idx_facts_source ON facts(source_document_id)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}

pub(crate) fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub(crate) fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
pub(crate) async fn test_db() -> SqlitePool {
    let path = std::env::temp_dir().join(format!("session-rag-test-{}.db", uuid::Uuid::new_v4()));
    open_db(&path).await.unwrap()
}
