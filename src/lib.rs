//! # lex-sentinel
//!
//! Tracks changes to legal acts and assesses whether those changes
//! require updates to an organization's internal documents (templates,
//! policies, contracts).
//!
//! The core is a recursive hierarchical summarization and change-impact
//! pipeline: act fragments are clustered by embedding similarity and
//! summarized bottom-up into a tree; version-to-version changes are
//! detected by content-hash alignment; each change is scored against the
//! most similar internal documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌─────────────┐   ┌────────────┐
//! │ Fragments │──▶│ Clustering │──▶│  Recursive   │──▶│   Change    │
//! │  (SQLite) │   │  (cosine)  │   │ Summarizer  │   │  Detection  │
//! └───────────┘   └────────────┘   └─────────────┘   └─────┬──────┘
//!                                                          ▼
//!                                                   ┌────────────┐
//!                                                   │   Impact    │
//!                                                   │ Assessment  │
//!                                                   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lex init                                        # create database
//! lex ingest act --slug vat --title "VAT Act" --file vat_2024.txt
//! lex ingest doc --title "Invoicing policy" --file policy.txt
//! lex summarize act vat                           # build summary tree
//! lex diff vat --from 1 --to 2                    # detect changes
//! lex assess vat --from 1 --to 2                  # score document impact
//! lex report vat --from 1 --to 2                  # print results
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Engine error taxonomy |
//! | [`fragment`] | Article/paragraph fragment splitters |
//! | [`store`] | Fragment store + content-addressed embedding cache |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generation`] | Generation provider abstraction + response schemas |
//! | [`prompts`] | Versioned prompt registry |
//! | [`cluster`] | Similarity clustering |
//! | [`summarize`] | Recursive bottom-up summarization |
//! | [`diff`] | Version change detection |
//! | [`assess`] | Change-impact scoring |
//! | [`show`] | Result printing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod assess;
pub mod cluster;
pub mod config;
pub mod db;
pub mod diff;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod fragment;
pub mod generation;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod prompts;
pub mod show;
pub mod store;
pub mod summarize;
