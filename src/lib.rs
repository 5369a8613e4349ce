//! # relay-rs
//!
//! Request/reply work dispatch over a message broker.
//!
//! A [`dispatch::Dispatcher`] tags each work request with a fresh correlation
//! token and publishes it; a [`confirm::ConfirmationTracker`] observes the
//! broker's accept/reject/return verdict; a [`worker::Worker`] drops
//! redelivered duplicates via the [`dedup::Deduplicator`], runs the job,
//! notifies, and replies; a [`reply::ReplyCorrelator`] joins replies back to
//! their requests by token.

pub mod broker;
pub mod config;
pub mod confirm;
pub mod db;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod notify;
pub mod reply;
pub mod telemetry;
pub mod topology;
pub mod worker;
