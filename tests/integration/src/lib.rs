//! Cross-crate integration tests
//!
//! This test suite validates:
//! - instruction lifecycle from wire payload to acknowledgment
//! - handlers driving hardware through leased channels
//! - store-and-forward upload reconciliation and purge
//! - channel contention between concurrent polls

pub mod test_utils;

#[cfg(test)]
mod instruction_lifecycle_tests;

#[cfg(test)]
mod relay_control_tests;

#[cfg(test)]
mod upload_reconciliation_tests;
