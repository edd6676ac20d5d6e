//! Vector index: fixed-dimension embeddings with a coarse prefilter.
//!
//! Each record stores the L2-normalized embedding plus its projections onto a
//! small set of fixed sample vectors. For unit vectors `u`, `v` and a unit
//! sample `s`, `|u·s − v·s| ≤ ‖u − v‖`, so the L∞ distance between stored and
//! query projections lower-bounds the true distance. A record is pruned when
//! that bound already puts its cosine below the requested minimum; survivors
//! get an exact cosine score. Queries are always restricted to an explicit
//! candidate document set; there is no global scan path.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::embedding::{check_dimension, cosine_similarity, normalize};
use crate::errors::EngineError;
use crate::guard;
use crate::store::{deserialize_embedding, serialize_embedding};

/// Seed for the fixed sample vectors. Changing it invalidates every stored
/// projection, so it is part of the on-disk format.
const SAMPLE_SEED: u64 = 0x5e55_1084_a3f1_77d2;

/// A stored embedding keyed by document and chunk.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub document_id: String,
    pub chunk_index: i64,
    pub embedding: Vec<f32>,
}

/// A query hit with its exact cosine score.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub document_id: String,
    pub chunk_index: i64,
    pub score: f32,
}

#[derive(Clone)]
pub struct VectorIndex {
    pool: SqlitePool,
    dim: usize,
    samples: Vec<Vec<f32>>,
}

impl VectorIndex {
    pub fn new(pool: SqlitePool, dim: usize, sample_count: usize) -> Self {
        Self {
            pool,
            dim,
            samples: sample_vectors(sample_count, dim),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Insert one record. Wrong-dimension embeddings are an error, never a
    /// silent truncation.
    pub async fn insert(
        &self,
        document_id: &str,
        chunk_index: i64,
        embedding: Vec<f32>,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;
        self.insert_in_tx(&mut tx, document_id, chunk_index, embedding)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        document_id: &str,
        chunk_index: i64,
        embedding: Vec<f32>,
    ) -> Result<(), EngineError> {
        check_dimension(self.dim, &embedding)?;
        let record = VectorRecord {
            document_id: document_id.to_string(),
            chunk_index,
            embedding: normalize(embedding),
        };
        guard::assert_vector_has_document_id(&record)?;

        let projections = self.project(&record.embedding);
        sqlx::query(
            "INSERT OR REPLACE INTO vectors (document_id, chunk_index, embedding, projections)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&record.document_id)
        .bind(record.chunk_index)
        .bind(serialize_embedding(&record.embedding))
        .bind(serialize_embedding(&projections))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Batched insert for ingestion. Returns the number of records stored;
    /// a dimension mismatch skips that record with a warning.
    pub async fn insert_bulk(&self, records: Vec<VectorRecord>) -> Result<usize, EngineError> {
        let mut tx = self.pool.begin().await?;
        let inserted = self.insert_bulk_in_tx(&mut tx, records).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn insert_bulk_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        records: Vec<VectorRecord>,
    ) -> Result<usize, EngineError> {
        let mut inserted = 0;
        for record in records {
            match self
                .insert_in_tx(tx, &record.document_id, record.chunk_index, record.embedding)
                .await
            {
                Ok(()) => inserted += 1,
                Err(EngineError::EmbeddingDimensionMismatch { expected, got }) => {
                    tracing::warn!(
                        document_id = %record.document_id,
                        chunk_index = record.chunk_index,
                        expected,
                        got,
                        "skipping vector with mismatched dimension"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(inserted)
    }

    /// Rank chunks of the candidate documents against a query embedding.
    ///
    /// Results are sorted by descending cosine, ties broken by insertion
    /// order (earlier chunk wins), truncated to `k`, then filtered to
    /// `score >= min_score`. An empty candidate set short-circuits without
    /// touching storage.
    pub async fn query(
        &self,
        query_embedding: &[f32],
        candidate_doc_ids: &[String],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredRecord>, EngineError> {
        if candidate_doc_ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        check_dimension(self.dim, query_embedding)?;

        let query_vec = normalize(query_embedding.to_vec());
        let query_proj = self.project(&query_vec);
        // cos(u, v) >= min_score implies ||u - v|| <= sqrt(2 * (1 - min_score)).
        let prune_distance = (2.0 * (1.0 - min_score.min(1.0))).max(0.0).sqrt();

        let placeholders = vec!["?"; candidate_doc_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, document_id, chunk_index, embedding, projections FROM vectors
             WHERE document_id IN ({placeholders})
             ORDER BY id"
        );
        let mut query = sqlx::query(&sql);
        for id in candidate_doc_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let total = rows.len();
        let mut pruned = 0usize;
        let mut scored: Vec<(i64, ScoredRecord)> = Vec::new();

        for row in rows {
            let projections = deserialize_embedding(&row.get::<Vec<u8>, _>("projections"));
            let coarse = linf_distance(&query_proj, &projections);
            if coarse > prune_distance {
                pruned += 1;
                continue;
            }

            let embedding = deserialize_embedding(&row.get::<Vec<u8>, _>("embedding"));
            let score = cosine_similarity(&query_vec, &embedding);
            scored.push((
                row.get::<i64, _>("id"),
                ScoredRecord {
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    score,
                },
            ));
        }

        tracing::debug!(total, pruned, "vector query coarse filter");

        scored.sort_by(|(a_id, a), (b_id, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a_id.cmp(b_id))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| record.score >= min_score)
            .collect())
    }

    /// Delete every record of a document. Part of the document-deletion
    /// cascade only; session deletion never reaches this.
    pub async fn remove_for_document(&self, document_id: &str) -> Result<u64, EngineError> {
        let mut tx = self.pool.begin().await?;
        let removed = self.remove_for_document_in_tx(&mut tx, document_id).await?;
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn remove_for_document_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        document_id: &str,
    ) -> Result<u64, EngineError> {
        let removed = sqlx::query("DELETE FROM vectors WHERE document_id = ?1")
            .bind(document_id)
            .execute(&mut **tx)
            .await?
            .rows_affected();
        Ok(removed)
    }

    pub async fn count(&self, document_id: Option<&str>) -> Result<usize, EngineError> {
        let count: i64 = match document_id {
            Some(id) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE document_id = ?1")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM vectors")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as usize)
    }

    /// Vectors whose document no longer exists, grouped by document id.
    pub async fn orphaned(&self) -> Result<Vec<(String, usize)>, EngineError> {
        let rows = sqlx::query(
            "SELECT document_id, COUNT(*) AS n FROM vectors
             WHERE document_id NOT IN (SELECT id FROM documents)
             GROUP BY document_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("document_id"), row.get::<i64, _>("n") as usize))
            .collect())
    }

    fn project(&self, vector: &[f32]) -> Vec<f32> {
        self.samples
            .iter()
            .map(|s| s.iter().zip(vector).map(|(a, b)| a * b).sum())
            .collect()
    }
}

fn linf_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Deterministic unit sample vectors shared by every index instance.
fn sample_vectors(count: usize, dim: usize) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
    (0..count)
        .map(|_| {
            let raw: Vec<f32> = (0..dim).map(|_| rng.random_range(-1.0f32..1.0)).collect();
            normalize(raw)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_db;

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    async fn index(dim: usize) -> VectorIndex {
        VectorIndex::new(test_db().await, dim, 4)
    }

    #[tokio::test]
    async fn query_is_restricted_to_candidates() {
        let index = index(4).await;
        index.insert("doc-x", 0, unit(4, 0)).await.unwrap();
        // doc-y matches the query perfectly but is not a candidate.
        index.insert("doc-y", 0, unit(4, 1)).await.unwrap();

        let results = index
            .query(&unit(4, 1), &["doc-x".to_string()], 10, -1.0)
            .await
            .unwrap();

        assert!(results.iter().all(|r| r.document_id == "doc-x"));
    }

    #[tokio::test]
    async fn empty_candidate_set_returns_nothing() {
        let index = index(4).await;
        index.insert("doc-x", 0, unit(4, 0)).await.unwrap();
        let results = index.query(&unit(4, 0), &[], 10, 0.0).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn ranking_and_min_score() {
        let index = index(4).await;
        let doc = "doc-1".to_string();
        index.insert(&doc, 0, vec![1.0, 0.0, 0.0, 0.0]).await.unwrap();
        index.insert(&doc, 1, vec![0.9, 0.1, 0.0, 0.0]).await.unwrap();
        index.insert(&doc, 2, vec![0.0, 0.0, 1.0, 0.0]).await.unwrap();

        let results = index
            .query(&unit(4, 0), &[doc.clone()], 10, 0.5)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_index, 0);
        assert_eq!(results[1].chunk_index, 1);
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn ties_resolve_to_earlier_insertion() {
        let index = index(4).await;
        let doc = "doc-1".to_string();
        index.insert(&doc, 0, unit(4, 0)).await.unwrap();
        index.insert(&doc, 1, unit(4, 0)).await.unwrap();

        let results = index.query(&unit(4, 0), &[doc], 1, 0.0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_index, 0);
    }

    #[tokio::test]
    async fn coarse_filter_never_drops_a_qualifying_record() {
        let index = index(8).await;
        let doc = "doc-1".to_string();

        // A spread of directions, some close to the query, some far.
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..32 {
            let v: Vec<f32> = (0..8).map(|_| rng.random_range(-1.0f32..1.0)).collect();
            index.insert(&doc, i, v).await.unwrap();
        }

        let query = unit(8, 0);
        let filtered = index
            .query(&query, &[doc.clone()], 32, 0.4)
            .await
            .unwrap();
        // Brute force with no pruning threshold, filtered afterwards.
        let exact: Vec<_> = index
            .query(&query, &[doc], 32, -1.0)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.score >= 0.4)
            .collect();

        assert_eq!(filtered.len(), exact.len());
        for (a, b) in filtered.iter().zip(&exact) {
            assert_eq!(a.chunk_index, b.chunk_index);
        }
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected_and_bulk_skips() {
        let index = index(4).await;
        let err = index.insert("doc-1", 0, vec![1.0, 0.0]).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::EmbeddingDimensionMismatch { expected: 4, got: 2 }
        ));

        let inserted = index
            .insert_bulk(vec![
                VectorRecord {
                    document_id: "doc-1".to_string(),
                    chunk_index: 0,
                    embedding: unit(4, 0),
                },
                VectorRecord {
                    document_id: "doc-1".to_string(),
                    chunk_index: 1,
                    embedding: vec![1.0],
                },
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(index.count(Some("doc-1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remove_for_document_reports_count() {
        let index = index(4).await;
        index.insert("doc-1", 0, unit(4, 0)).await.unwrap();
        index.insert("doc-1", 1, unit(4, 1)).await.unwrap();
        index.insert("doc-2", 0, unit(4, 2)).await.unwrap();

        let removed = index.remove_for_document("doc-1").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(index.count(None).await.unwrap(), 1);
    }

    #[test]
    fn sample_vectors_are_deterministic_units() {
        let a = sample_vectors(4, 16);
        let b = sample_vectors(4, 16);
        assert_eq!(a, b);
        for v in &a {
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }
}
