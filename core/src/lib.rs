//! Provider/team matching and capacity reservation for a cleaning-service
//! marketplace.
//!
//! Layering, leaf-first: availability → candidates → scoring → team →
//! capacity → locks → engine → scheduler. Only `store` runs SQL.

pub mod access;
pub mod availability;
pub mod candidates;
pub mod capacity;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod locks;
pub mod model;
pub mod notify;
pub mod pricing;
pub mod scheduler;
pub mod scoring;
pub mod store;
pub mod team;
pub mod types;
pub mod weights;
