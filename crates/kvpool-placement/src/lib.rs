//! kvpool Placement - replica placement over mounted segments
//!
//! This crate decides which segment serves each slice of a replica.
//! The default strategy picks segments at random, weighted by free
//! bytes, so load spreads across contributors without a central
//! balance pass.

mod strategy;

pub use strategy::{AllocationStrategy, RandomStrategy};
