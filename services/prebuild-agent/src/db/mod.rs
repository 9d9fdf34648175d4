//! Persistence for prebuild events, VM tasks, and log chunks.

pub mod store;

pub use store::{PrebuildEvent, Store, StoreError, VmTask, VmTaskStatus};
