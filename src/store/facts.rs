//! Fact store: durable knowledge derived from documents.
//!
//! Facts outlive the documents they came from. Deleting a document flips
//! `source_removed` on its facts; the facts themselves are removed only by a
//! full user purge.

use serde::{Deserialize, Serialize};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::errors::EngineError;

/// Well-known fact categories, with a fallback for anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    Preference,
    Profile,
    Knowledge,
    Metric,
    Other,
}

impl FactCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FactCategory::Preference => "preference",
            FactCategory::Profile => "profile",
            FactCategory::Knowledge => "knowledge",
            FactCategory::Metric => "metric",
            FactCategory::Other => "other",
        }
    }

    fn from_str(raw: &str) -> Self {
        match raw {
            "preference" => FactCategory::Preference,
            "profile" => FactCategory::Profile,
            "knowledge" => FactCategory::Knowledge,
            "metric" => FactCategory::Metric,
            _ => FactCategory::Other,
        }
    }
}

/// Tagged fact value. `Json` is the unstructured-extra fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FactValue {
    Text(String),
    Number(f64),
    Flag(bool),
    Json(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct Fact {
    pub id: String,
    pub owner_id: String,
    pub key: String,
    pub category: FactCategory,
    pub value: FactValue,
    pub source_document_id: Option<String>,
    pub source_removed: bool,
    pub confidence: f64,
}

#[derive(Clone)]
pub struct FactStore {
    pool: SqlitePool,
}

impl FactStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a fact by `(owner, key)`.
    pub async fn upsert(
        &self,
        owner_id: &str,
        key: &str,
        category: FactCategory,
        value: FactValue,
        source_document_id: Option<&str>,
        confidence: f64,
    ) -> Result<String, EngineError> {
        let id = uuid::Uuid::new_v4().to_string();
        let value_json = serde_json::to_string(&value)
            .map_err(|e| EngineError::Config(format!("serialize fact value: {e}")))?;

        sqlx::query(
            "INSERT INTO facts (id, owner_id, key, category, value, source_document_id, source_removed, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
             ON CONFLICT (owner_id, key) DO UPDATE SET
                category = excluded.category,
                value = excluded.value,
                source_document_id = excluded.source_document_id,
                source_removed = excluded.source_removed,
                confidence = excluded.confidence",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(key)
        .bind(category.as_str())
        .bind(value_json)
        .bind(source_document_id)
        .bind(confidence)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get(&self, owner_id: &str, key: &str) -> Result<Option<Fact>, EngineError> {
        let row = sqlx::query(
            "SELECT id, owner_id, key, category, value, source_document_id, source_removed, confidence
             FROM facts WHERE owner_id = ?1 AND key = ?2",
        )
        .bind(owner_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_fact).transpose()
    }

    pub async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Fact>, EngineError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, key, category, value, source_document_id, source_removed, confidence
             FROM facts WHERE owner_id = ?1 ORDER BY key",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_fact).collect()
    }

    pub async fn list_for_document(&self, doc_id: &str) -> Result<Vec<Fact>, EngineError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, key, category, value, source_document_id, source_removed, confidence
             FROM facts WHERE source_document_id = ?1 ORDER BY key",
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_fact).collect()
    }

    /// Flip `source_removed` on every fact referencing a deleted document.
    /// The facts themselves are never deleted here.
    pub async fn mark_source_removed_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        doc_id: &str,
    ) -> Result<u64, EngineError> {
        let marked = sqlx::query(
            "UPDATE facts SET source_removed = 1 WHERE source_document_id = ?1",
        )
        .bind(doc_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
        Ok(marked)
    }

    /// Remove every fact of an owner. Only the user purge calls this.
    pub async fn remove_for_owner_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        owner_id: &str,
    ) -> Result<u64, EngineError> {
        let removed = sqlx::query("DELETE FROM facts WHERE owner_id = ?1")
            .bind(owner_id)
            .execute(&mut **tx)
            .await?
            .rows_affected();
        Ok(removed)
    }

    pub async fn count_for_owner(&self, owner_id: &str) -> Result<usize, EngineError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facts WHERE owner_id = ?1")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

fn parse_fact(row: sqlx::sqlite::SqliteRow) -> Result<Fact, EngineError> {
    let raw_value: String = row.get("value");
    let value = serde_json::from_str(&raw_value).unwrap_or(FactValue::Text(raw_value));
    let category: String = row.get("category");

    Ok(Fact {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        key: row.get("key"),
        category: FactCategory::from_str(&category),
        value,
        source_document_id: row.get("source_document_id"),
        source_removed: row.get::<i64, _>("source_removed") != 0,
        confidence: row.get("confidence"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_db;

    #[tokio::test]
    async fn upsert_replaces_by_owner_and_key() {
        let store = FactStore::new(test_db().await);

        store
            .upsert("u1", "favorite_color", FactCategory::Preference,
                FactValue::Text("blue".to_string()), None, 0.9)
            .await
            .unwrap();
        store
            .upsert("u1", "favorite_color", FactCategory::Preference,
                FactValue::Text("green".to_string()), None, 0.95)
            .await
            .unwrap();

        let facts = store.list_for_owner("u1").await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, FactValue::Text("green".to_string()));
        assert!((facts[0].confidence - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn marking_source_removed_keeps_the_fact() {
        let store = FactStore::new(test_db().await);
        store
            .upsert("u1", "project_deadline", FactCategory::Knowledge,
                FactValue::Text("friday".to_string()), Some("doc-1"), 1.0)
            .await
            .unwrap();
        store
            .upsert("u1", "team_size", FactCategory::Metric,
                FactValue::Number(7.0), Some("doc-2"), 1.0)
            .await
            .unwrap();

        let mut tx = store.pool.begin().await.unwrap();
        let marked = store.mark_source_removed_in_tx(&mut tx, "doc-1").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(marked, 1);
        let facts = store.list_for_owner("u1").await.unwrap();
        assert_eq!(facts.len(), 2);

        let deadline = store.get("u1", "project_deadline").await.unwrap().unwrap();
        assert!(deadline.source_removed);
        let team = store.get("u1", "team_size").await.unwrap().unwrap();
        assert!(!team.source_removed);
    }

    #[tokio::test]
    async fn purge_removes_only_that_owner() {
        let store = FactStore::new(test_db().await);
        store
            .upsert("u1", "a", FactCategory::Other, FactValue::Flag(true), None, 1.0)
            .await
            .unwrap();
        store
            .upsert("u2", "b", FactCategory::Other, FactValue::Flag(false), None, 1.0)
            .await
            .unwrap();

        let mut tx = store.pool.begin().await.unwrap();
        let removed = store.remove_for_owner_in_tx(&mut tx, "u1").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(store.count_for_owner("u1").await.unwrap(), 0);
        assert_eq!(store.count_for_owner("u2").await.unwrap(), 1);
    }
}
