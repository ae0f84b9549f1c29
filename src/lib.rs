//! PharmaTrail: custody ledger and verification engine for pharmaceutical
//! batches.
//!
//! This crate provides:
//! - Durable SQLite storage for parties, medicines, batches, transfers,
//!   verifications, and counterfeit reports
//! - A custody ledger with atomic quantity movements and a tamper-evident
//!   hash chain over all transfers
//! - Batch verification: code resolution, expiry derivation, and an
//!   append-only verification log
//! - A counterfeit report queue with admin triage
//!
//! The CLI wrapper lives in `src/main.rs`.

#![deny(unsafe_code)]

pub mod error;
pub mod config;

pub mod batch;
pub mod ledger;
pub mod medicine;
pub mod party;
pub mod report;
pub mod store;
pub mod util;
pub mod verify;
