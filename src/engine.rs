//! Engine facade: the host-facing handle tying the subsystems together.
//!
//! An [`EngineHandle`] owns the database, the stores, the embedding pool, and
//! the open session contexts. Hosts construct it with a config and an
//! [`Embedder`] capability; everything else is internal. Mutations for one
//! owner are serialized behind a per-owner lock so capacity checks and the
//! deletion cascades never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::chunker;
use crate::config::EngineConfig;
use crate::context::{
    keyword_rank, AssembledContext, RankedChunk, RetrievalMode, SessionContext, Tier,
};
use crate::coordinator::DeletionCoordinator;
use crate::embedding::{Embedder, EmbeddingPool};
use crate::errors::EngineError;
use crate::store::{
    open_db, Document, DocumentMeta, DocumentPool, Fact, FactCategory, FactStore, FactValue,
    VectorIndex, VectorRecord,
};
use crate::tokens::{CharRatioEstimator, TokenEstimator};

pub struct EngineHandle {
    config: EngineConfig,
    db: SqlitePool,
    documents: DocumentPool,
    vectors: VectorIndex,
    facts: FactStore,
    coordinator: DeletionCoordinator,
    embeddings: EmbeddingPool,
    estimator: Arc<dyn TokenEstimator>,
    sessions: RwLock<HashMap<String, SessionContext>>,
    owner_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EngineHandle {
    /// Open the engine with the default character-ratio token estimator.
    pub async fn open(
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<Self>, EngineError> {
        Self::open_with_estimator(config, embedder, Arc::new(CharRatioEstimator::default())).await
    }

    pub async fn open_with_estimator(
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Arc<Self>, EngineError> {
        if embedder.dimension() != config.embedding_dim {
            return Err(EngineError::EmbeddingDimensionMismatch {
                expected: config.embedding_dim,
                got: embedder.dimension(),
            });
        }

        let db = open_db(&config.db_path).await?;
        let documents = DocumentPool::new(db.clone(), config.pool_capacity);
        let vectors = VectorIndex::new(db.clone(), config.embedding_dim, config.sample_vector_count);
        let facts = FactStore::new(db.clone());
        let coordinator = DeletionCoordinator::new(
            db.clone(),
            documents.clone(),
            vectors.clone(),
            facts.clone(),
            config.guard_enabled,
        );
        let embeddings = EmbeddingPool::new(
            embedder,
            config.embed_worker_count(),
            config.embedding_cache_entries,
            config.embedding_dim,
        );

        tracing::info!(
            db = %config.db_path.display(),
            dim = config.embedding_dim,
            workers = config.embed_worker_count(),
            "engine opened"
        );

        Ok(Arc::new(Self {
            config,
            db,
            documents,
            vectors,
            facts,
            coordinator,
            embeddings,
            estimator,
            sessions: RwLock::new(HashMap::new()),
            owner_locks: Mutex::new(HashMap::new()),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Flush and close the database. The handle is unusable afterwards.
    pub async fn close(&self) {
        self.db.close().await;
    }

    // --- sessions ---

    /// Open a session context. Re-opening an existing session keeps its
    /// current tier, mode, and state.
    pub async fn open_session(&self, session_id: &str, tier: Tier) {
        let mut sessions = self.sessions.write().await;
        sessions.entry(session_id.to_string()).or_insert_with(|| {
            SessionContext::new(
                session_id,
                tier,
                self.estimator.clone(),
                self.config.guard_enabled,
            )
        });
    }

    pub async fn set_state_context(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<(), EngineError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        session.set_state_context(text);
        Ok(())
    }

    pub async fn set_mode(
        &self,
        session_id: &str,
        mode: RetrievalMode,
    ) -> Result<(), EngineError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        session.set_mode(mode)
    }

    // --- documents ---

    /// Ingest a document: chunk, embed, and store it in one transaction.
    /// The document starts active in its origin session only.
    pub async fn upload(
        &self,
        owner_id: &str,
        origin_session_id: &str,
        meta: DocumentMeta,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let lock = self.owner_lock(owner_id).await;
        let _guard = lock.lock().await;

        self.documents.check_capacity(owner_id).await?;

        let chunks = chunker::split_text(
            text,
            self.config.chunk_size,
            self.config.chunk_overlap,
            self.config.max_chunks_per_document,
            self.estimator.as_ref(),
        );
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embeddings.embed_batch(&texts, cancel).await?;

        let mut tx = self.db.begin().await?;
        let doc_id = self
            .documents
            .insert_in_tx(&mut tx, owner_id, origin_session_id, &meta, &chunks)
            .await?;
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .filter_map(|(chunk, embedding)| {
                embedding.map(|embedding| VectorRecord {
                    document_id: doc_id.clone(),
                    chunk_index: chunk.chunk_index as i64,
                    embedding,
                })
            })
            .collect();
        let stored = self.vectors.insert_bulk_in_tx(&mut tx, records).await?;
        tx.commit().await?;

        tracing::info!(
            doc_id = %doc_id,
            owner_id,
            chunks = chunks.len(),
            vectors = stored,
            "document uploaded"
        );
        Ok(doc_id)
    }

    /// Pull an existing document of the same owner into a session.
    pub async fn activate(
        &self,
        doc_id: &str,
        session_id: &str,
        owner_id: &str,
    ) -> Result<(), EngineError> {
        let lock = self.owner_lock(owner_id).await;
        let _guard = lock.lock().await;
        self.documents.activate(doc_id, session_id, owner_id).await
    }

    /// Drop a document from a session. A missing document is a no-op, same
    /// as removing a membership that does not exist.
    pub async fn deactivate(&self, doc_id: &str, session_id: &str) -> Result<(), EngineError> {
        let Some(doc) = self.documents.get(doc_id).await? else {
            return Ok(());
        };
        let lock = self.owner_lock(&doc.owner_id).await;
        let _guard = lock.lock().await;
        self.documents.deactivate(doc_id, session_id).await
    }

    pub async fn document(&self, doc_id: &str) -> Result<Option<Document>, EngineError> {
        self.documents.get(doc_id).await
    }

    /// Documents currently retrievable by a session.
    pub async fn active_documents(&self, session_id: &str) -> Result<Vec<Document>, EngineError> {
        self.documents.active_for(session_id).await
    }

    // --- facts ---

    pub async fn remember_fact(
        &self,
        owner_id: &str,
        key: &str,
        category: FactCategory,
        value: FactValue,
        source_document_id: Option<&str>,
        confidence: f64,
    ) -> Result<String, EngineError> {
        self.facts
            .upsert(owner_id, key, category, value, source_document_id, confidence)
            .await
    }

    pub async fn facts_for_owner(&self, owner_id: &str) -> Result<Vec<Fact>, EngineError> {
        self.facts.list_for_owner(owner_id).await
    }

    // --- retrieval ---

    /// Rank the session's active chunks against a query, without assembling a
    /// context. Candidates are always the session's active documents; there
    /// is no global search path.
    pub async fn query(
        &self,
        session_id: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RankedChunk>, EngineError> {
        self.retrieve(session_id, query, cancel).await
    }

    /// Run retrieval for one turn and assemble the session's context.
    ///
    /// Candidates are the session's active documents; an empty set yields a
    /// context with no retrieval section. When the embedder reports itself
    /// unavailable and the keyword fallback is enabled, retrieval degrades to
    /// keyword matching instead of failing the turn.
    pub async fn build_context(
        &self,
        session_id: &str,
        query: &str,
        chat_history: &[String],
        cancel: &CancellationToken,
    ) -> Result<AssembledContext, EngineError> {
        {
            let sessions = self.sessions.read().await;
            if !sessions.contains_key(session_id) {
                return Err(EngineError::SessionNotFound(session_id.to_string()));
            }
        }

        let ranked = self.retrieve(session_id, query, cancel).await?;

        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        session.build_context(chat_history, &ranked)
    }

    async fn retrieve(
        &self,
        session_id: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RankedChunk>, EngineError> {
        let candidates: Vec<String> = self
            .documents
            .active_for(session_id)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        match self.embeddings.embed(query, cancel).await {
            Ok(query_vec) => {
                let hits = self
                    .vectors
                    .query(&query_vec, &candidates, self.config.top_k, self.config.min_score)
                    .await?;
                let mut ranked = Vec::with_capacity(hits.len());
                for hit in hits {
                    if let Some(text) = self
                        .documents
                        .chunk_text(&hit.document_id, hit.chunk_index)
                        .await?
                    {
                        ranked.push(RankedChunk {
                            document_id: hit.document_id,
                            chunk_index: hit.chunk_index,
                            text,
                            score: hit.score,
                        });
                    }
                }
                Ok(ranked)
            }
            Err(EngineError::EmbeddingUnavailable(reason)) if self.config.keyword_fallback => {
                tracing::warn!(%reason, "embedder unavailable, using keyword retrieval");
                let chunks = self.documents.chunks_for(&candidates).await?;
                Ok(keyword_rank(query, &chunks, self.config.top_k))
            }
            Err(e) => Err(e),
        }
    }

    // --- deletion ---

    pub async fn delete_document(&self, doc_id: &str) -> Result<(), EngineError> {
        let owner_id = self
            .documents
            .get(doc_id)
            .await?
            .ok_or_else(|| EngineError::DocumentNotFound(doc_id.to_string()))?
            .owner_id;
        let lock = self.owner_lock(&owner_id).await;
        let _guard = lock.lock().await;
        self.coordinator.delete_document(doc_id).await
    }

    /// Close a session and strip it from every document's membership set.
    pub async fn delete_session(&self, session_id: &str) -> Result<u64, EngineError> {
        self.sessions.write().await.remove(session_id);

        // Membership rows can span owners; lock each affected owner in the
        // store's stable order so the strip cannot interleave with that
        // owner's uploads or deletion cascades.
        let owners = self.documents.owners_for_session(session_id).await?;
        let locks: Vec<Arc<Mutex<()>>> = {
            let mut acquired = Vec::with_capacity(owners.len());
            for owner in &owners {
                acquired.push(self.owner_lock(owner).await);
            }
            acquired
        };
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.lock().await);
        }

        self.coordinator.delete_session(session_id).await
    }

    pub async fn delete_all_for_user(&self, owner_id: &str) -> Result<usize, EngineError> {
        let lock = self.owner_lock(owner_id).await;
        let _guard = lock.lock().await;
        self.coordinator.delete_all_for_user(owner_id).await
    }

    pub async fn purge_user(&self, owner_id: &str) -> Result<(), EngineError> {
        let lock = self.owner_lock(owner_id).await;
        let _guard = lock.lock().await;
        self.coordinator.purge_user(owner_id).await
    }

    pub async fn integrity_scan(&self) -> Result<(), EngineError> {
        self.coordinator.integrity_scan().await
    }

    async fn owner_lock(&self, owner_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.owner_locks.lock().await;
        locks
            .entry(owner_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Deterministic bag-of-words embedder: each term lands on a hashed axis,
    /// so texts sharing words score high together.
    struct HashEmbedder {
        dim: usize,
        down: AtomicBool,
    }

    impl HashEmbedder {
        fn new(dim: usize) -> Self {
            Self {
                dim,
                down: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(EngineError::EmbeddingUnavailable("model offline".into()));
            }
            let mut v = vec![0.0f32; self.dim];
            for word in text.to_lowercase().split_whitespace() {
                let mut h = 0usize;
                for b in word.bytes() {
                    h = h.wrapping_mul(31).wrapping_add(b as usize);
                }
                v[h % self.dim] += 1.0;
            }
            Ok(v)
        }

        fn dimension(&self) -> usize {
            self.dim
        }
    }

    fn test_config() -> EngineConfig {
        let path = std::env::temp_dir()
            .join(format!("session-rag-engine-{}.db", uuid::Uuid::new_v4()));
        EngineConfig {
            db_path: path,
            embedding_dim: 32,
            chunk_size: 120,
            chunk_overlap: 20,
            min_score: 0.05,
            ..EngineConfig::default()
        }
    }

    fn meta(name: &str) -> DocumentMeta {
        DocumentMeta {
            filename: name.to_string(),
            size_bytes: 64,
            mime_type: "text/plain".to_string(),
            extra: serde_json::json!({}),
        }
    }

    async fn engine() -> (Arc<EngineHandle>, Arc<HashEmbedder>) {
        let embedder = Arc::new(HashEmbedder::new(32));
        let engine = EngineHandle::open(test_config(), embedder.clone())
            .await
            .unwrap();
        (engine, embedder)
    }

    #[tokio::test]
    async fn upload_then_retrieve_in_origin_session() {
        let (engine, _) = engine().await;
        let cancel = CancellationToken::new();
        engine.open_session("s1", Tier::Standard).await;

        engine
            .upload(
                "u1",
                "s1",
                meta("whales.txt"),
                "Humpback whales migrate between polar feeding grounds and tropical breeding waters.",
                &cancel,
            )
            .await
            .unwrap();

        let out = engine
            .build_context("s1", "where do humpback whales migrate", &[], &cancel)
            .await
            .unwrap();
        assert!(out.chunks_used >= 1);
        assert!(out.assembled_text.contains("migrate"));
    }

    #[tokio::test]
    async fn sessions_see_only_their_active_documents() {
        let (engine, _) = engine().await;
        let cancel = CancellationToken::new();
        engine.open_session("s1", Tier::Standard).await;
        engine.open_session("s2", Tier::Standard).await;

        let doc = engine
            .upload(
                "u1",
                "s1",
                meta("whales.txt"),
                "Humpback whales migrate between polar feeding grounds and tropical breeding waters.",
                &cancel,
            )
            .await
            .unwrap();

        let out = engine
            .build_context("s2", "humpback whales migrate", &[], &cancel)
            .await
            .unwrap();
        assert_eq!(out.chunks_used, 0);

        engine.activate(&doc, "s2", "u1").await.unwrap();
        let out = engine
            .build_context("s2", "humpback whales migrate", &[], &cancel)
            .await
            .unwrap();
        assert!(out.chunks_used >= 1);
    }

    #[tokio::test]
    async fn query_returns_ranked_chunks_with_text() {
        let (engine, _) = engine().await;
        let cancel = CancellationToken::new();
        engine.open_session("s1", Tier::Standard).await;

        let doc = engine
            .upload(
                "u1",
                "s1",
                meta("tides.txt"),
                "Spring tides occur when the sun and moon align.",
                &cancel,
            )
            .await
            .unwrap();

        let ranked = engine
            .query("s1", "spring tides sun moon", &cancel)
            .await
            .unwrap();
        assert!(!ranked.is_empty());
        assert_eq!(ranked[0].document_id, doc);
        assert!(ranked[0].text.contains("align"));
        assert!(ranked[0].score > 0.0);
    }

    #[tokio::test]
    async fn keyword_fallback_covers_embedder_outage() {
        let (engine, embedder) = engine().await;
        let cancel = CancellationToken::new();
        engine.open_session("s1", Tier::Standard).await;

        engine
            .upload(
                "u1",
                "s1",
                meta("notes.txt"),
                "The quarterly revenue target is twelve million.",
                &cancel,
            )
            .await
            .unwrap();

        embedder.down.store(true, Ordering::SeqCst);
        let out = engine
            .build_context("s1", "quarterly revenue", &[], &cancel)
            .await
            .unwrap();
        assert!(out.chunks_used >= 1);
        assert!(out.assembled_text.contains("twelve million"));
    }

    #[tokio::test]
    async fn outage_without_fallback_is_an_error() {
        let embedder = Arc::new(HashEmbedder::new(32));
        let mut config = test_config();
        config.keyword_fallback = false;
        let engine = EngineHandle::open(config, embedder.clone()).await.unwrap();
        let cancel = CancellationToken::new();
        engine.open_session("s1", Tier::Standard).await;
        engine
            .upload("u1", "s1", meta("a.txt"), "some document text here", &cancel)
            .await
            .unwrap();

        embedder.down.store(true, Ordering::SeqCst);
        let err = engine
            .build_context("s1", "anything", &[], &cancel)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn capacity_error_clears_after_deletion() {
        let embedder = Arc::new(HashEmbedder::new(32));
        let mut config = test_config();
        config.pool_capacity = 2;
        let engine = EngineHandle::open(config, embedder).await.unwrap();
        let cancel = CancellationToken::new();
        engine.open_session("s1", Tier::Standard).await;

        let first = engine
            .upload("u1", "s1", meta("a.txt"), "first document", &cancel)
            .await
            .unwrap();
        engine
            .upload("u1", "s1", meta("b.txt"), "second document", &cancel)
            .await
            .unwrap();

        let err = engine
            .upload("u1", "s1", meta("c.txt"), "third document", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded { .. }));

        engine.delete_document(&first).await.unwrap();
        engine
            .upload("u1", "s1", meta("c.txt"), "third document", &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn activating_a_deleted_document_strands_no_membership() {
        let (engine, _) = engine().await;
        let cancel = CancellationToken::new();
        engine.open_session("s1", Tier::Standard).await;
        engine.open_session("s2", Tier::Standard).await;

        let doc = engine
            .upload("u1", "s1", meta("a.txt"), "short document body", &cancel)
            .await
            .unwrap();
        engine.delete_document(&doc).await.unwrap();

        let err = engine.activate(&doc, "s2", "u1").await.unwrap_err();
        assert!(matches!(err, EngineError::DocumentNotFound(_)));

        let stranded: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM document_sessions
             WHERE document_id NOT IN (SELECT id FROM documents)",
        )
        .fetch_one(&engine.db)
        .await
        .unwrap();
        assert_eq!(stranded, 0);
    }

    #[tokio::test]
    async fn concurrent_activation_and_deletion_stay_consistent() {
        let (engine, _) = engine().await;
        let cancel = CancellationToken::new();
        engine.open_session("s1", Tier::Standard).await;
        engine.open_session("s2", Tier::Standard).await;

        let doc = engine
            .upload("u1", "s1", meta("a.txt"), "short document body", &cancel)
            .await
            .unwrap();

        // Whichever side wins the owner lock, the losing side must either
        // see the document gone or have its membership swept by the cascade.
        let activator = {
            let engine = engine.clone();
            let doc = doc.clone();
            tokio::spawn(async move { engine.activate(&doc, "s2", "u1").await })
        };
        let deleter = {
            let engine = engine.clone();
            let doc = doc.clone();
            tokio::spawn(async move { engine.delete_document(&doc).await })
        };
        let _ = activator.await.unwrap();
        deleter.await.unwrap().unwrap();

        let stranded: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM document_sessions
             WHERE document_id NOT IN (SELECT id FROM documents)",
        )
        .fetch_one(&engine.db)
        .await
        .unwrap();
        assert_eq!(stranded, 0);
        engine.integrity_scan().await.unwrap();
    }

    #[tokio::test]
    async fn session_deletion_spans_multiple_owners() {
        let (engine, _) = engine().await;
        let cancel = CancellationToken::new();
        engine.open_session("s1", Tier::Standard).await;

        let a = engine
            .upload("u1", "s1", meta("a.txt"), "first body", &cancel)
            .await
            .unwrap();
        let b = engine
            .upload("u2", "s1", meta("b.txt"), "second body", &cancel)
            .await
            .unwrap();

        // Two owners share the session; both sets of memberships go.
        let removed = engine.delete_session("s1").await.unwrap();
        assert_eq!(removed, 2);
        assert!(engine.document(&a).await.unwrap().unwrap().is_orphaned());
        assert!(engine.document(&b).await.unwrap().unwrap().is_orphaned());
    }

    #[tokio::test]
    async fn mode_gating_goes_through_the_session() {
        let (engine, _) = engine().await;
        engine.open_session("standard", Tier::Standard).await;
        engine.open_session("premium", Tier::Premium).await;

        let err = engine
            .set_mode("standard", RetrievalMode::Authoritative)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ModeNotAllowed { .. }));

        engine
            .set_mode("premium", RetrievalMode::Authoritative)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let (engine, _) = engine().await;
        let cancel = CancellationToken::new();
        let err = engine
            .build_context("nope", "query", &[], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
    }
}
