//! # threadline core
//!
//! Retrieval over an archive of past tool-use conversations: token-aware
//! chunking, the embedding backend seam, a generation-based vector index,
//! the three-stage hybrid retriever and conversation-level aggregation.
//!
//! This crate contains no sqlx, filesystem I/O, or runtime setup. The
//! corpus, lexical search and persistence are reached through traits; the
//! `threadline` crate supplies SQLite-backed implementations.

pub mod aggregate;
pub mod chunk;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod search;
pub mod store;
pub mod testing;
pub mod tokenize;
