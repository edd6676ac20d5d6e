//! Per-session retrieval context and token budgeting.
//!
//! Assembly allocates budget in strict priority order: the fixed system
//! preamble, then authoritative state (never trimmed), then volatile chat
//! history (oldest dropped first), then RAG chunks (lowest score dropped
//! first). State token counts are asserted identical before and after
//! assembly; RAG volume can never evict durable state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::guard;
use crate::store::documents::StoredChunk;
use crate::tokens::TokenEstimator;

const SYSTEM_PREAMBLE: &str =
    "You are answering with the user's documents and durable context below.";

const ANALYSIS_INSTRUCTION: &str =
    "Retrieved passages follow. You may paraphrase and synthesize across them.";

const AUTHORITATIVE_INSTRUCTION: &str =
    "Retrieved passages follow. Quote them verbatim; do not synthesize or paraphrase.";

/// Subscription tier, which fixes the token budget table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Standard,
    Premium,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Standard => "standard",
            Tier::Premium => "premium",
        }
    }

    pub fn budget(self) -> ContextBudget {
        match self {
            Tier::Free => ContextBudget {
                state: 1000,
                rag: 0,
                volatile: 4000,
                response: 4000,
                total: 8000,
            },
            Tier::Standard => ContextBudget {
                state: 2000,
                rag: 3000,
                volatile: 6000,
                response: 5000,
                total: 16000,
            },
            Tier::Premium => ContextBudget {
                state: 3000,
                rag: 6000,
                volatile: 8000,
                response: 8000,
                total: 24000,
            },
        }
    }
}

/// Token allocation per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub state: usize,
    pub rag: usize,
    pub volatile: usize,
    pub response: usize,
    pub total: usize,
}

/// How retrieved chunks may be used by the downstream model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Paraphrase and synthesis allowed.
    Analysis,
    /// Quote-only; gated to the highest tier.
    Authoritative,
}

impl RetrievalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalMode::Analysis => "analysis",
            RetrievalMode::Authoritative => "authoritative",
        }
    }
}

/// A retrieval hit carrying its chunk text, ready for budgeting.
#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f32,
}

/// Output of context assembly, handed to the external prompt assembler.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub assembled_text: String,
    pub chunks_used: usize,
    pub truncated: bool,
    pub state_tokens: usize,
    pub rag_tokens: usize,
}

pub struct SessionContext {
    session_id: String,
    tier: Tier,
    mode: RetrievalMode,
    state_context: String,
    state_tokens: usize,
    estimator: Arc<dyn TokenEstimator>,
    guard_enabled: bool,
}

impl SessionContext {
    pub fn new(
        session_id: &str,
        tier: Tier,
        estimator: Arc<dyn TokenEstimator>,
        guard_enabled: bool,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            tier,
            mode: RetrievalMode::Analysis,
            state_context: String::new(),
            state_tokens: 0,
            estimator,
            guard_enabled,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn mode(&self) -> RetrievalMode {
        self.mode
    }

    pub fn state_tokens(&self) -> usize {
        self.state_tokens
    }

    /// Select the retrieval mode. `Authoritative` is Premium-only.
    pub fn set_mode(&mut self, mode: RetrievalMode) -> Result<(), EngineError> {
        if mode == RetrievalMode::Authoritative && self.tier != Tier::Premium {
            return Err(EngineError::ModeNotAllowed {
                tier: self.tier.as_str().to_string(),
                mode: mode.as_str().to_string(),
            });
        }
        self.mode = mode;
        Ok(())
    }

    /// Set the authoritative state content (user facts and preferences).
    /// Counted against the budget but excluded from all truncation.
    pub fn set_state_context(&mut self, text: &str) {
        self.state_context = text.to_string();
        self.state_tokens = self.estimator.estimate(text);
    }

    /// Assemble the context for one turn.
    ///
    /// `ranked_chunks` is the retrieval output; chunks are dropped lowest
    /// score first until the RAG section fits, and history is dropped oldest
    /// first until the volatile section fits.
    pub fn build_context(
        &self,
        chat_history: &[String],
        ranked_chunks: &[RankedChunk],
    ) -> Result<AssembledContext, EngineError> {
        let budget = self.tier.budget();
        let state_tokens_before = self.state_tokens;
        let mut truncated = false;

        let preamble_tokens = self.estimator.estimate(SYSTEM_PREAMBLE);

        // Volatile history: keep the newest messages that fit.
        let mut kept_history: Vec<&String> = Vec::new();
        let mut volatile_tokens = 0usize;
        for message in chat_history.iter().rev() {
            let cost = self.estimator.estimate(message);
            if volatile_tokens + cost > budget.volatile {
                truncated = true;
                break;
            }
            volatile_tokens += cost;
            kept_history.push(message);
        }
        kept_history.reverse();

        // RAG: bounded by its own allocation and by what the total leaves.
        let used_so_far = preamble_tokens + state_tokens_before + volatile_tokens;
        let headroom = budget
            .total
            .saturating_sub(budget.response)
            .saturating_sub(used_so_far);
        let rag_budget = budget.rag.min(headroom);

        let mut ordered: Vec<&RankedChunk> = ranked_chunks.iter().collect();
        ordered.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Keep a prefix of the score-descending order: dropping stops at the
        // first chunk that overflows, so a lower-scored chunk can never ride
        // in on a budget a higher-scored one was denied.
        let mut kept_chunks: Vec<&RankedChunk> = Vec::new();
        let mut rag_tokens = 0usize;
        for chunk in ordered {
            let block = format_chunk(chunk, kept_chunks.len() + 1);
            let cost = self.estimator.estimate(&block);
            if rag_tokens + cost > rag_budget {
                truncated = true;
                break;
            }
            rag_tokens += cost;
            kept_chunks.push(chunk);
        }

        let assembled_text = self.render(&kept_history, &kept_chunks);

        // State content is carried through untouched; recount to prove it.
        let state_tokens_after = self.estimator.estimate(&self.state_context);
        if self.guard_enabled {
            guard::assert_state_never_evicted(state_tokens_before, state_tokens_after, rag_tokens)?;
        }

        Ok(AssembledContext {
            assembled_text,
            chunks_used: kept_chunks.len(),
            truncated,
            state_tokens: state_tokens_after,
            rag_tokens,
        })
    }

    fn render(&self, history: &[&String], chunks: &[&RankedChunk]) -> String {
        let mut out = String::from(SYSTEM_PREAMBLE);
        out.push_str("\n\n");

        if !self.state_context.is_empty() {
            out.push_str("## Durable context\n");
            out.push_str(&self.state_context);
            out.push_str("\n\n");
        }

        if !history.is_empty() {
            out.push_str("## Conversation\n");
            for message in history {
                out.push_str(message);
                out.push('\n');
            }
            out.push('\n');
        }

        if !chunks.is_empty() {
            match self.mode {
                RetrievalMode::Analysis => out.push_str(ANALYSIS_INSTRUCTION),
                RetrievalMode::Authoritative => out.push_str(AUTHORITATIVE_INSTRUCTION),
            }
            out.push('\n');
            for (i, chunk) in chunks.iter().enumerate() {
                out.push_str(&format_chunk(chunk, i + 1));
            }
        }

        out.trim_end().to_string()
    }
}

fn format_chunk(chunk: &RankedChunk, position: usize) -> String {
    format!(
        "[{position}] (doc {} chunk {}, relevance {:.2})\n{}\n\n",
        chunk.document_id, chunk.chunk_index, chunk.score, chunk.text
    )
}

/// Keyword-only ranking used when the embedder is unavailable and the
/// fallback matcher is configured. Scores are the fraction of query terms
/// present in the chunk.
pub fn keyword_rank(query: &str, chunks: &[StoredChunk], top_k: usize) -> Vec<RankedChunk> {
    let query_lower = query.to_lowercase();
    let terms: Vec<&str> = query_lower.split_whitespace().collect();
    if terms.is_empty() {
        return Vec::new();
    }

    let mut ranked: Vec<RankedChunk> = chunks
        .iter()
        .filter_map(|chunk| {
            let text_lower = chunk.text.to_lowercase();
            let matches = terms.iter().filter(|t| text_lower.contains(*t)).count();
            if matches == 0 {
                return None;
            }
            Some(RankedChunk {
                document_id: chunk.document_id.clone(),
                chunk_index: chunk.chunk_index,
                text: chunk.text.clone(),
                score: matches as f32 / terms.len() as f32,
            })
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(top_k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::CharRatioEstimator;

    fn context(tier: Tier) -> SessionContext {
        SessionContext::new("s1", tier, Arc::new(CharRatioEstimator::default()), true)
    }

    fn chunk(doc: &str, index: i64, text: &str, score: f32) -> RankedChunk {
        RankedChunk {
            document_id: doc.to_string(),
            chunk_index: index,
            text: text.to_string(),
            score,
        }
    }

    #[test]
    fn free_tier_never_includes_chunks() {
        let ctx = context(Tier::Free);
        let chunks = vec![chunk("d1", 0, "highly relevant text", 0.99)];

        let out = ctx.build_context(&[], &chunks).unwrap();
        assert_eq!(out.chunks_used, 0);
        assert_eq!(out.rag_tokens, 0);
        assert!(out.truncated);
        assert!(!out.assembled_text.contains("highly relevant"));
    }

    #[test]
    fn state_tokens_unchanged_by_rag_volume() {
        let mut ctx = context(Tier::Premium);
        ctx.set_state_context("The user is a marine biologist based in Lisbon.");
        let before = ctx.state_tokens();

        let chunks: Vec<RankedChunk> = (0..200)
            .map(|i| chunk("d1", i, &"dense retrieval text ".repeat(40), 0.9))
            .collect();

        let out = ctx.build_context(&[], &chunks).unwrap();
        assert_eq!(out.state_tokens, before);
        assert!(out.truncated);
        assert!(out.assembled_text.contains("marine biologist"));
    }

    #[test]
    fn chunks_drop_lowest_score_first() {
        let ctx = context(Tier::Standard);
        // Each block is ~1100 tokens; the standard rag budget fits two only.
        let text = "x".repeat(4400);
        let chunks = vec![
            chunk("d1", 0, &text, 0.2),
            chunk("d1", 1, &text, 0.9),
            chunk("d1", 2, &text, 0.6),
            chunk("d1", 3, &text, 0.8),
        ];

        let out = ctx.build_context(&[], &chunks).unwrap();
        assert!(out.chunks_used < chunks.len());
        assert!(out.truncated);

        // The highest scores survive.
        assert!(out.assembled_text.contains("relevance 0.90"));
        let lowest_included = out.assembled_text.contains("relevance 0.20");
        assert!(!lowest_included);
    }

    #[test]
    fn small_chunk_never_displaces_a_larger_higher_scored_one() {
        let ctx = context(Tier::Standard);
        // Second-best chunk overflows the rag budget; the small low-scored
        // chunk behind it must not slip in on the freed space.
        let chunks = vec![
            chunk("d1", 0, &"a".repeat(4000), 0.9),
            chunk("d1", 1, &"b".repeat(10_000), 0.8),
            chunk("d1", 2, &"c".repeat(2000), 0.5),
        ];

        let out = ctx.build_context(&[], &chunks).unwrap();
        assert_eq!(out.chunks_used, 1);
        assert!(out.truncated);
        assert!(out.assembled_text.contains("relevance 0.90"));
        assert!(!out.assembled_text.contains("relevance 0.80"));
        assert!(!out.assembled_text.contains("relevance 0.50"));
    }

    #[test]
    fn oversized_top_chunk_yields_an_empty_rag_section() {
        let ctx = context(Tier::Standard);
        // The best chunk alone exceeds the rag budget, so nothing fits.
        let chunks = vec![
            chunk("d1", 0, &"a".repeat(13_000), 0.9),
            chunk("d1", 1, &"b".repeat(4000), 0.5),
        ];

        let out = ctx.build_context(&[], &chunks).unwrap();
        assert_eq!(out.chunks_used, 0);
        assert_eq!(out.rag_tokens, 0);
        assert!(out.truncated);
        assert!(!out.assembled_text.contains("relevance 0.50"));
    }

    #[test]
    fn history_drops_oldest_first() {
        let ctx = context(Tier::Free);
        // The oldest message alone exceeds the free volatile budget.
        let old = format!("user: {}", "old message ".repeat(1400));
        let history = vec![
            old,
            "assistant: middle".to_string(),
            "user: newest question".to_string(),
        ];

        let out = ctx.build_context(&history, &[]).unwrap();
        assert!(out.truncated);
        assert!(out.assembled_text.contains("newest question"));
        assert!(out.assembled_text.contains("middle"));
        assert!(!out.assembled_text.contains("old message"));
    }

    #[test]
    fn authoritative_mode_is_premium_only() {
        let mut standard = context(Tier::Standard);
        let err = standard.set_mode(RetrievalMode::Authoritative).unwrap_err();
        assert!(matches!(err, EngineError::ModeNotAllowed { .. }));

        let mut premium = context(Tier::Premium);
        premium.set_mode(RetrievalMode::Authoritative).unwrap();

        let out = premium
            .build_context(&[], &[chunk("d1", 0, "quote me", 0.9)])
            .unwrap();
        assert!(out.assembled_text.contains("do not synthesize"));
    }

    #[test]
    fn analysis_mode_allows_paraphrase() {
        let ctx = context(Tier::Standard);
        let out = ctx
            .build_context(&[], &[chunk("d1", 0, "some passage", 0.9)])
            .unwrap();
        assert!(out.assembled_text.contains("may paraphrase"));
    }

    #[test]
    fn keyword_rank_orders_by_term_fraction() {
        let chunks = vec![
            StoredChunk {
                document_id: "d1".to_string(),
                chunk_index: 0,
                text: "The blue sky over the blue sea".to_string(),
                token_estimate: 8,
            },
            StoredChunk {
                document_id: "d1".to_string(),
                chunk_index: 1,
                text: "Nothing relevant here".to_string(),
                token_estimate: 5,
            },
            StoredChunk {
                document_id: "d2".to_string(),
                chunk_index: 0,
                text: "sky report".to_string(),
                token_estimate: 3,
            },
        ];

        let ranked = keyword_rank("blue sky", &chunks, 10);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].chunk_index, 0);
        assert_eq!(ranked[0].document_id, "d1");
        assert!(ranked[0].score > ranked[1].score);
    }
}
