//! Semantic memory and pattern insight for a local-first journal.
//!
//! echo-memory sits next to a journaling application's entry store and
//! gives it two capabilities:
//!
//! - **Retrieval**: free-form questions ("what was I anxious about last
//!   month?") answered with relevance-ranked entries. Search runs in stages
//!   over full-text, summary and sentence vectors, with a recency bonus and
//!   a lexical fallback when the embedding model is unavailable.
//! - **Patterns**: recurring moods, topics, times and habits discovered by
//!   clustering the whole entry history, scored for confidence and kept up
//!   to date by a background scheduler.
//!
//! # Architecture
//!
//! - **Storage**: the journal's SQLite database, with FTS5 for the lexical
//!   index and [sqlite-vec](https://github.com/asg017/sqlite-vec) for
//!   in-database cosine similarity
//! - **Embeddings**: local ONNX Runtime with BGE-small-en-v1.5 (384
//!   dimensions), loaded lazily on first use
//! - **Transport**: MCP over stdio (primary) or streamable HTTP, plus a CLI
//!
//! # Modules
//!
//! - [`config`]: configuration loading from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations and health checks
//! - [`embedding`]: the encoder service and its model providers
//! - [`memory`]: vector store, retrieval, clustering, pattern detection, scheduling
//! - [`engine`]: the async facade the host application and the MCP tools call

pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod memory;
pub mod server;
pub mod tools;

pub use engine::MemoryEngine;
pub use error::{EngineError, Result};
