//! bookvill: a content catalog REST API for serialized fiction.
//!
//! This crate provides the BookVill backend: readers browse, search and
//! bookmark novels, manga, manhwa and webtoons organized by category and
//! chapter, with JWT authentication and per-user reading progress.
//!
//! # Features
//!
//! - Paginated, filtered, sorted book discovery with relevance search
//! - Two-level category tree with denormalized book counts
//! - Chapters with format-keyed content (text vs page images)
//! - User accounts with incremental reading statistics
//! - Bookmarks with format-specific positions and reading statuses
//! - Cascading book deletion (chapters, bookmarks, category counts)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Authentication and account management.
pub mod auth;
/// Catalog service and query composition.
pub mod catalog;
/// Configuration and CLI.
pub mod config;
/// Database operations and entity model.
pub mod db;
/// Error types.
pub mod error;
/// HTTP server.
pub mod server;

#[cfg(test)]
mod tests;

pub use config::{Cli, Command, Config};
pub use db::Database;
pub use error::{AppError, Result};
pub use server::AppState;
