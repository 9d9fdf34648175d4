//! Task scripts and the concurrent prebuild task supervisor.

pub mod scripts;
pub mod supervisor;

pub use supervisor::{
    launch_background_tasks, SessionFactory, SessionFuture, TaskResult, TaskSupervisor,
};
