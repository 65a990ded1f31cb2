//! Core firewall management functionality
//!
//! Layered leaves first:
//!
//! - [`expr`], [`codec`]: typed nft rule expressions and decoding of chain listings
//! - [`marker`]: comment markers identifying rules nftgate owns
//! - [`compiler`]: domain intents to ordered add/delete operations
//! - [`control`]: the nft process boundary ([`control::ControlPlane`])
//! - [`txn`]: ordered execution with rollback
//! - [`quota`], [`forward`], [`store`]: lifecycle managers and the disabled-forward store
//! - [`snapshot`]: whole-ruleset save and restore
//! - [`controller`]: the caller-facing facade
//! - [`error`]: error types for all of the above

pub mod codec;
pub mod compiler;
pub mod control;
pub mod controller;
pub mod error;
pub mod expr;
pub mod forward;
pub mod marker;
pub mod model;
pub mod quota;
pub mod snapshot;
pub mod store;
pub mod topology;
pub mod txn;

#[cfg(test)]
pub mod test_helpers;
