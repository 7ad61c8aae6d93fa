//! Listing negotiation engine for a peer-to-peer book exchange.
//!
//! Takes a book listing from "available" through rounds of interest and
//! proposals, resolves concurrent claims so a listing has exactly one
//! winner, and commits the outcome (archival, counters, notifications)
//! exactly once.

pub mod arbiter;
pub mod book;
pub mod conversation;
pub mod error;
pub mod listing;
pub mod notify;
pub mod service;
pub mod settlement;
pub mod store;
pub mod timestamp;
pub mod utils;
