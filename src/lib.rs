//! # threadline
//!
//! Hybrid lexical and semantic search over an archive of past AI tool
//! conversations.
//!
//! The retrieval algorithms live in `threadline-core`; this crate supplies
//! the SQLite persistence, the concrete embedding backends, the JSONL
//! importer and the CLI glue.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────────┐
//! │ JSONL import│──▶│   SQLite    │◀──│ index build   │
//! │             │   │ corpus+FTS5 │   │ chunk + embed │
//! └─────────────┘   │ chunks+meta │   └───────────────┘
//!                   └──────┬──────┘
//!                          ▼
//!                ┌───────────────────┐
//!                │ search (read-only)│
//!                │ recall → rerank → │
//!                │ diversity → group │
//!                └───────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! threadline init
//! threadline import ./exports/
//! threadline index build
//! threadline search "token refresh race" --by-conversation
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Writer and read-only connections |
//! | [`migrate`] | Schema creation |
//! | [`ingest`] | JSONL conversation import |
//! | [`sqlite_store`] | SQLite index store and corpus collaborators |
//! | [`embedding`] | Local and Ollama embedding backends |
//! | [`lock`] | Single-writer build lock |
//! | [`progress`] | Build progress on stderr |
//! | [`index_cmd`] | `index build` / `index status` |
//! | [`search`] | `search` / `first-mention` |

pub mod config;
pub mod db;
pub mod embedding;
pub mod index_cmd;
pub mod ingest;
pub mod lock;
pub mod migrate;
pub mod progress;
pub mod search;
pub mod sqlite_store;
