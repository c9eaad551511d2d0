//! State management for batch execution
//!
//! This module provides the per-task status store, its response cache, and
//! the notifier that wakes up anyone waiting on aggregate task state.

pub mod notifier;
pub mod store;

pub use notifier::{Notifier, Observer, ObserverId, Subscription};
pub use store::{AckStatus, StatusEntry, StatusStore, StatusSummary, TaskStatus};
