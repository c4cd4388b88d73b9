//! # Repo Pulse
//!
//! Long-horizon software-health metrics for git repositories.
//!
//! Repo Pulse keeps a local clone of each tracked repository, walks its
//! commit history to derive per-file complexity deltas, interleaves
//! issue / pull-request / release data from the hosting provider, and
//! materializes an annotated snapshot of the current source tree. All of
//! it lands in SQLite as per-day time series an engineering team can watch
//! drift over the years.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────────────────┐   ┌──────────┐
//! │ git clone │──▶│  Pipeline (task DAG)          │──▶│  SQLite   │
//! │ provider  │   │ history · issues · metrics    │   │ upserts   │
//! │ API/hooks │   │ source-tree snapshot          │   │ by key    │
//! └───────────┘   └──────────────────────────────┘   └────┬─────┘
//!                                                          │
//!                                     ┌────────────────────┤
//!                                     ▼                    ▼
//!                               ┌──────────┐        ┌──────────┐
//!                               │   CLI    │        │ webhook  │
//!                               │ (pulse)  │        │ receiver │
//!                               └──────────┘        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pulse init                              # create database
//! pulse add acme-widget https://github.com/acme/widget.git
//! pulse ingest acme-widget                # full history ingest
//! pulse update --all                      # daily incremental update
//! pulse metrics acme-widget --days 90     # print the health series
//! pulse serve                             # start the webhook receiver
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`models`] | Core data types |
//! | [`shell`] | Shell execution for git plumbing |
//! | [`repo`] | Canonical clones and scratch working copies |
//! | [`provider`] | Hosting-provider HTTP client (JWT, pagination, retry) |
//! | [`changes`] | Per-commit complexity extraction |
//! | [`history`] | Commit history and tag ingestion |
//! | [`issues`] | Issue / pull-request / release ingestion |
//! | [`metrics`] | Per-day aggregation and resampling |
//! | [`tree`] | Annotated source-tree snapshots |
//! | [`pipeline`] | Task-DAG orchestration and status machine |
//! | [`store`] | Typed upsert-by-natural-key persistence |
//! | [`webhook`] | Hook verification and dispatch registry |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod changes;
pub mod config;
pub mod db;
pub mod history;
pub mod issues;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod provider;
pub mod repo;
pub mod shell;
pub mod stats;
pub mod store;
pub mod tree;
pub mod webhook;
