//! Lease Scheduler: re-emits delivery tasks for due and abandoned notifications.

pub mod rebalancer;
