//! Session and job-template abstraction over a distributed resource manager.
//!
//! The [`DrmSession`] trait mirrors the standard submission API of cluster
//! schedulers: templates are created and deleted through the session, jobs
//! are submitted from a template, and completion is observed through status
//! queries and blocking waits. [`sge::SgeSession`] drives Grid Engine through
//! its command-line tools.

pub mod sge;

use crate::config::EnvMap;
use crate::error::{PiperError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub type JobId = String;

/// Submission descriptor for one job or one bulk submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTemplate {
    /// Session-side handle assigned at creation.
    pub handle: u64,
    pub job_name: String,
    pub working_directory: PathBuf,
    pub output_path: PathBuf,
    pub error_path: PathBuf,
    pub job_environment: EnvMap,
    pub remote_command: String,
    pub args: Vec<String>,
    pub native_specification: String,
    pub join_files: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    Forever,
    NoWait,
    Seconds(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Held,
    Running,
    Suspended,
    Done,
    Failed,
    Undetermined,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Held => "held",
            JobState::Running => "running",
            JobState::Suspended => "suspended",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Undetermined => "undetermined",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the scheduler reports once a job has been reaped by `wait`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobInfo {
    pub job_id: JobId,
    pub has_exited: bool,
    pub has_signal: bool,
    pub was_aborted: bool,
    pub exit_status: i32,
    /// Scheduler accounting, keyed `start_time`, `end_time`, `ru_maxrss` when known.
    pub resource_usage: BTreeMap<String, String>,
}

/// Bulk task range, half-open: `start, start+step, ...` while `< end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRange {
    pub start: u32,
    pub end: u32,
    pub step: u32,
}

impl TaskRange {
    /// Requires `0 < start < start + step < end`, i.e. at least two tasks.
    pub fn new(start: u32, end: u32, step: u32) -> Result<Self> {
        let well_defined = start > 0
            && step > 0
            && start
                .checked_add(step)
                .map(|next| next < end)
                .unwrap_or(false);
        if !well_defined {
            return Err(PiperError::Configuration(format!(
                "number of tasks in array job not well-defined: {}-{}-{}",
                start, end, step
            )));
        }
        Ok(TaskRange { start, end, step })
    }

    pub fn tasks(&self) -> impl Iterator<Item = u32> {
        (self.start..self.end).step_by(self.step as usize)
    }

    pub fn last_task(&self) -> u32 {
        let span = self.end - 1 - self.start;
        self.start + span - span % self.step
    }
}

/// Connection to a distributed resource manager.
///
/// Implementations must tolerate concurrent calls; the manager serialises
/// template mutation and submission itself.
pub trait DrmSession: Send + Sync + fmt::Debug {
    /// Human-readable identification of the scheduler behind the session.
    fn contact(&self) -> String;

    fn initialize(&self) -> Result<()>;

    fn exit(&self) -> Result<()>;

    fn create_job_template(&self) -> Result<JobTemplate>;

    fn delete_job_template(&self, template: &JobTemplate) -> Result<()>;

    fn run_job(&self, template: &JobTemplate) -> Result<JobId>;

    fn run_bulk_jobs(&self, template: &JobTemplate, range: TaskRange) -> Result<Vec<JobId>>;

    fn job_status(&self, job_id: &str) -> Result<JobState>;

    fn wait(&self, job_id: &str, timeout: WaitTimeout) -> Result<JobInfo>;

    /// Blocks until every job has finished. With `dispose == false` the jobs
    /// must still be reaped individually with [`DrmSession::wait`].
    fn synchronize(&self, job_ids: &[JobId], timeout: WaitTimeout, dispose: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_range_rejects_degenerate_ranges() {
        assert!(TaskRange::new(5, 5, 1).is_err());
        assert!(TaskRange::new(0, 10, 1).is_err());
        assert!(TaskRange::new(1, 10, 0).is_err());
        assert!(TaskRange::new(1, 3, 2).is_err(), "single task is not an array");
        assert!(TaskRange::new(u32::MAX - 1, u32::MAX, 5).is_err());
        let err = TaskRange::new(5, 5, 1).expect_err("empty range");
        assert!(matches!(err, PiperError::Configuration(_)));
    }

    #[test]
    fn task_range_is_half_open() {
        let range = TaskRange::new(1, 10, 2).expect("valid range");
        assert_eq!(range.tasks().collect::<Vec<_>>(), vec![1, 3, 5, 7, 9]);
        assert_eq!(range.last_task(), 9);

        let range = TaskRange::new(2, 8, 3).expect("valid range");
        assert_eq!(range.tasks().collect::<Vec<_>>(), vec![2, 5]);
        assert_eq!(range.last_task(), 5);
    }
}
