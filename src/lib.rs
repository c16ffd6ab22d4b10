//! onionharvest - resilient product-record acquisition from Tor-proxied
//! marketplaces.
//!
//! A long-lived navigation loop that survives transient failures, detects
//! active blocking and rotates its network identity, extracts fields through
//! tolerant fallback selector chains, and checkpoints every captured record
//! durably so interrupted runs resume without re-fetching anything.

pub mod browser;
pub mod cli;
pub mod config;
pub mod crawl;
pub mod detect;
pub mod error;
pub mod extract;
pub mod identity;
pub mod pacing;
pub mod record;
pub mod seed;
pub mod store;
