// ── Memory Engine ──────────────────────────────────────────────────────────
//
// The unified long-term memory subsystem: a multi-tier store with hybrid
// retrieval (dense vectors + BM25), cross-encoder reranking, outcome-weighted
// scoring, deferred embedding, and a knowledge graph over extracted entities.
//
// Sub-modules:
//   - schema / store: document store (SQLite + FTS5) for items, outcomes, KG
//   - embedding: dense vectorization with circuit breaker + degraded fallback
//   - rerank: cross-encoder rescoring, fail-closed
//   - vector_index: Qdrant REST adapter with payload/filter contract
//   - knowledge_graph: entity normalization, co-occurrence nodes/edges
//   - retriever: hybrid fan-out + weighted RRF + rerank + debug
//   - scoring: Wilson-scored feedback, time decay, promotion/archival
//   - reindex: background re-embedding of items missing vectors
//   - backup: JSON bundle export/import
//   - facade: the public surface everything above the engine talks to

pub mod backup;
pub mod embedding;
pub mod facade;
pub mod knowledge_graph;
pub mod reindex;
pub mod rerank;
pub mod retriever;
pub mod schema;
pub mod scoring;
pub mod store;
pub mod vector_index;

// Re-exports for convenience
pub use facade::{MemoryFacade, MemoryPatch, PrefetchRequest, PrefetchResult, StoreRequest, StoreResult};
pub use retriever::{HybridRetriever, SearchRequest, SearchResponse};
pub use store::MemoryStore;
