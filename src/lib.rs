//! Local-first persistent memory for AI coding assistants.
//!
//! open-mem continuously captures tool-execution events and chat messages
//! from an agent host, distills them into typed observations, and injects a
//! compact, token-budgeted index back into each new session so the agent can
//! pick up where the prior one left off.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector KNN, one
//!   database per project at `<project>/.open-mem/memory.db`
//! - **Pipeline**: a durable, back-pressured pending queue drained by a
//!   batched processor; captures round-trip through redaction, AI
//!   compression, conflict resolution, embedding, and entity extraction
//! - **Search**: hybrid FTS + vector + knowledge-graph signals merged via
//!   Reciprocal Rank Fusion, with optional LLM reranking
//! - **Context**: progressive-disclosure index assembly under a hard token
//!   budget on every session start
//!
//! # Modules
//!
//! - [`config`] — layered configuration and git-worktree canonicalisation
//! - [`db`] — database initialization, schema, migrations, locking, health
//! - [`ai`] — compressor/embedder/reranker capability traits and the
//!   provider fallback chain
//! - [`memory`] — repositories: observations, sessions, pending queue,
//!   knowledge graph, redaction, search
//! - [`pipeline`] — the queue processor
//! - [`context`] — progressive-disclosure context assembly
//! - [`engine`] — the host-facing facade

pub mod ai;
pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod modes;
pub mod pipeline;

pub use engine::{ExportData, ImportStrategy, MemoryEngine, Providers};
pub use error::{MemError, Result};
