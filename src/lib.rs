//! nftgate - quota, allow-list and port-forward manager for nftables
//!
//! Presents bandwidth quotas, allowed inbound ports and port forwards as domain
//! objects and keeps the nftables rules behind them consistent.
//!
//! # Architecture
//!
//! - [`core`] - Rule codec and compiler, lifecycle managers, nft interaction
//! - [`audit`] - JSON-lines audit trail of every mutation
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration file and environment overrides
//! - [`elevation`] - sudo/run0 wrapping of the nft binary
//! - [`utils`] - State directory and atomic file writes
//!
//! # Safety Features
//!
//! - Multi-rule changes roll back applied steps when a later step fails
//! - Rules without an nftgate marker are never modified
//! - Comments are sanitized before they reach nft
//! - SHA-256 checked ruleset snapshots, written atomically with mode 0600

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use config::Config;
pub use core::controller::{Controller, ForwardRequest, ForwardTarget};
pub use core::error::{Error, Result};
pub use core::model::{AllowedPort, ForwardingRule, Protocol, QuotaRule, QuotaStatus};
