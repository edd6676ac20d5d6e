//! Assertion layer for the engine's lifecycle rules.
//!
//! Each function checks one rule and returns an [`InvariantViolation`] with a
//! stable discriminant when it fails. The happy path never fails. Callers gate
//! the checks on `EngineConfig::guard_enabled` in production; tests run them
//! unconditionally. A violation is always a programming error: it is logged
//! with the rule name and propagated, never swallowed.

use thiserror::Error;

use crate::store::facts::Fact;
use crate::store::vectors::VectorRecord;

/// The field a retrieval call site filters documents by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterField {
    /// Membership in `active_sessions`, the only correct filter.
    ActiveSessions,
    /// The session that originally uploaded the document. Filtering by this
    /// silently reintroduces cross-session leakage.
    OriginSession,
}

/// The pool operation being checked against the capacity limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOperation {
    Upload,
    Activate,
}

impl PoolOperation {
    fn as_str(self) -> &'static str {
        match self {
            PoolOperation::Upload => "upload",
            PoolOperation::Activate => "activate",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvariantViolation {
    #[error("retrieval filtered by origin_session_id instead of active_sessions")]
    ActiveSessionFilter,

    #[error("state context changed during assembly: {before} tokens before, {after} after, {rag_added} rag tokens added")]
    StateEviction {
        before: usize,
        after: usize,
        rag_added: usize,
    },

    #[error("facts changed by deletion of document {doc_id}: {before} facts before, {after} after")]
    FactsLost {
        doc_id: String,
        before: usize,
        after: usize,
    },

    #[error("document {doc_id} deleted but fact {fact_id} still has source_removed=false")]
    FactSourceNotMarked { doc_id: String, fact_id: String },

    #[error("pool limit reached on {operation}: {count}/{capacity}")]
    PoolLimit {
        count: usize,
        capacity: usize,
        operation: String,
    },

    #[error("vector record for chunk {chunk_index} has no document id")]
    VectorMissingDocumentId { chunk_index: i64 },
}

impl InvariantViolation {
    /// Stable rule identifier, used in logs and integrity reports.
    pub fn rule(&self) -> &'static str {
        match self {
            InvariantViolation::ActiveSessionFilter => "active-session-filter",
            InvariantViolation::StateEviction { .. } => "state-never-evicted",
            InvariantViolation::FactsLost { .. } => "facts-preserved-on-doc-delete",
            InvariantViolation::FactSourceNotMarked { .. } => "facts-preserved-on-doc-delete",
            InvariantViolation::PoolLimit { .. } => "pool-limit",
            InvariantViolation::VectorMissingDocumentId { .. } => "vector-has-document-id",
        }
    }
}

fn fail(violation: InvariantViolation) -> Result<(), InvariantViolation> {
    tracing::error!(rule = violation.rule(), "invariant violation: {violation}");
    Err(violation)
}

/// Retrieval must filter by active-session membership, never by origin.
pub fn assert_active_session_filter(field: FilterField) -> Result<(), InvariantViolation> {
    if field == FilterField::OriginSession {
        return fail(InvariantViolation::ActiveSessionFilter);
    }
    Ok(())
}

/// State context token count must be identical before and after RAG assembly.
pub fn assert_state_never_evicted(
    before: usize,
    after: usize,
    rag_added: usize,
) -> Result<(), InvariantViolation> {
    if before != after {
        return fail(InvariantViolation::StateEviction {
            before,
            after,
            rag_added,
        });
    }
    Ok(())
}

/// Document deletion must mark facts, never remove them.
pub fn assert_facts_preserved_on_doc_delete(
    doc_id: &str,
    facts_before: &[Fact],
    facts_after: &[Fact],
) -> Result<(), InvariantViolation> {
    if facts_before.len() != facts_after.len() {
        return fail(InvariantViolation::FactsLost {
            doc_id: doc_id.to_string(),
            before: facts_before.len(),
            after: facts_after.len(),
        });
    }
    for fact in facts_after {
        if fact.source_document_id.as_deref() == Some(doc_id) && !fact.source_removed {
            return fail(InvariantViolation::FactSourceNotMarked {
                doc_id: doc_id.to_string(),
                fact_id: fact.id.clone(),
            });
        }
    }
    Ok(())
}

/// Uploads must be rejected once the owner's pool is at capacity.
pub fn assert_pool_limit(
    current_count: usize,
    capacity: usize,
    operation: PoolOperation,
) -> Result<(), InvariantViolation> {
    if operation == PoolOperation::Upload && current_count >= capacity {
        return fail(InvariantViolation::PoolLimit {
            count: current_count,
            capacity,
            operation: operation.as_str().to_string(),
        });
    }
    Ok(())
}

/// Vectors are keyed by document, never by session.
pub fn assert_vector_has_document_id(record: &VectorRecord) -> Result<(), InvariantViolation> {
    if record.document_id.is_empty() {
        return fail(InvariantViolation::VectorMissingDocumentId {
            chunk_index: record.chunk_index,
        });
    }
    Ok(())
}
