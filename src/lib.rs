//! Session-scoped retrieval engine.
//!
//! An embeddable engine that manages per-user document pools, session-scoped
//! activation, vector retrieval with token-budgeted context assembly, and
//! durable extracted facts, all backed by a single SQLite file. The host
//! supplies the embedding model behind the [`Embedder`] trait and drives the
//! engine through an [`EngineHandle`].
//!
//! The load-bearing rule throughout: retrieval is filtered by a document's
//! active-session membership, never by the session that uploaded it. A
//! document deleted from one session stays retrievable from the others it was
//! activated in; deleting a session deletes no content at all.

pub mod chunker;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod embedding;
pub mod engine;
pub mod errors;
pub mod guard;
pub mod logging;
pub mod store;
pub mod tokens;

pub use config::EngineConfig;
pub use context::{AssembledContext, ContextBudget, RankedChunk, RetrievalMode, Tier};
pub use embedding::Embedder;
pub use engine::EngineHandle;
pub use errors::EngineError;
pub use guard::InvariantViolation;
pub use store::{Document, DocumentMeta, Fact, FactCategory, FactValue};
pub use tokens::{CharRatioEstimator, HfTokenEstimator, TokenEstimator};
