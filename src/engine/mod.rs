//! Engine modules: turn the inspected disk into a committed on-disk layout.
//!
//! `partition` decides and applies the partition table; `staging` formats and
//! mounts the result under the working root. Both generate command sequences
//! with pure functions and execute them through an [`Executor`](crate::command_executor::Executor).

pub mod partition;
pub mod staging;
