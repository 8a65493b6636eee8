//! # issuetrawl
//!
//! Windowed issue discovery and attachment sync for result-capped
//! trackers.
//!
//! The tracker's search caps how many results one query may return and
//! offers no cursor across an arbitrary date span. Discovery therefore
//! splits the span into adaptively narrowed windows that each fit under
//! the cap, paginates inside every window, and writes one creation-ordered
//! table per project. A separate sync pass fetches each record's manifest
//! document and mirrors the attachments it lists into a local archive,
//! using file mtimes stamped with the authoritative creation time to skip
//! anything already synchronized.
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌───────────┐
//! │ Partitioner│──▶│   Pager    │──▶│ CSV table │   trawl discover
//! └────────────┘   └────────────┘   └───────────┘
//!
//! ┌───────────┐   ┌─────────────┐   ┌───────────────┐
//! │ CSV table │──▶│ manifest XML │──▶│ attachment    │  trawl export
//! └───────────┘   └─────────────┘   │ archive (mtime│  trawl sync
//!                                   │  = createdAt) │
//!                                   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`session`] | Session capture and replay |
//! | [`client`] | HTTP query/byte sources and error taxonomy |
//! | [`windows`] | Adaptive window partitioning |
//! | [`pager`] | Offset pagination within one window |
//! | [`discover`] | Per-project discovery orchestration |
//! | [`export`] | Manifest document export |
//! | [`manifest`] | Manifest location and parsing |
//! | [`sync`] | Incremental attachment synchronization |
//! | [`progress`] | Stderr progress reporting |
//! | [`status`] | Environment health overview |

pub mod client;
pub mod config;
pub mod discover;
pub mod export;
pub mod manifest;
pub mod models;
pub mod pager;
pub mod progress;
pub mod session;
pub mod status;
pub mod sync;
pub mod windows;
