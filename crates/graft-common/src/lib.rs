//! Shared infrastructure for graft: subprocess orchestration, the process
//! registry, and the git adapter.

pub mod git;
pub mod process;
pub mod registry;

pub use git::GitError;
pub use process::{
    run_to_completion, CompletedProcess, OutputBuffer, ProcessConfig, ProcessError, ProcessEvent,
    ProcessHandle, DEFAULT_KILL_GRACE, MAX_BUFFERED_LINES,
};
pub use registry::{pid_alive, ProcessRecord};
