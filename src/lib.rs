//! Rolls raw player presence samples into cumulative active-hour totals.
//!
//! The [`scheduler::Scheduler`] drives a [`rollup::Aggregator`] on a fixed
//! interval. Each pass folds samples newer than a player's watermark into
//! hour buckets, counts the buckets that reach the quorum, and commits the
//! increment and the new watermark atomically through a
//! [`store::TotalsStore`].

pub mod config;
pub mod health;
pub mod migrate;
pub mod rollup;
pub mod scheduler;
pub mod service;
pub mod store;
