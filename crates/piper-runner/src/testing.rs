//! Scripted in-memory scheduler session for unit tests.

use crate::drm::{DrmSession, JobId, JobInfo, JobState, JobTemplate, TaskRange, WaitTimeout};
use crate::error::{PiperError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionCall {
    Initialize,
    Exit,
    CreateTemplate(u64),
    DeleteTemplate(u64),
    RunJob(JobId),
    RunBulk(Vec<JobId>),
    Status(JobId),
    Wait(JobId),
    Synchronize { ids: Vec<JobId>, dispose: bool },
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<SessionCall>,
    submitted: Vec<JobTemplate>,
    next_job: u64,
    next_handle: u64,
    live_templates: BTreeSet<u64>,
    usage: BTreeMap<String, String>,
    exit_status: i32,
    open: bool,
    fail_init: bool,
    fail_exit: bool,
    fail_submit: bool,
    fail_status: bool,
    fail_delete: BTreeSet<u64>,
    fail_wait: BTreeSet<String>,
    submission_delay: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct FakeSession {
    state: Mutex<FakeState>,
    in_submission: AtomicUsize,
    max_in_submission: AtomicUsize,
}

impl FakeSession {
    /// An already-open session.
    pub(crate) fn new() -> Self {
        let session = FakeSession::default();
        session.state().open = true;
        session
    }

    /// A session that still needs `initialize`.
    pub(crate) fn closed() -> Self {
        FakeSession::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn set_usage(&self, key: &str, value: &str) {
        self.state().usage.insert(key.to_string(), value.to_string());
    }

    pub(crate) fn set_exit_status(&self, status: i32) {
        self.state().exit_status = status;
    }

    pub(crate) fn set_submission_delay(&self, delay: Duration) {
        self.state().submission_delay = delay;
    }

    pub(crate) fn fail_init(&self) {
        self.state().fail_init = true;
    }

    pub(crate) fn fail_exit(&self) {
        self.state().fail_exit = true;
    }

    pub(crate) fn fail_submit(&self) {
        self.state().fail_submit = true;
    }

    pub(crate) fn fail_status(&self) {
        self.state().fail_status = true;
    }

    pub(crate) fn fail_delete_template(&self, handle: u64) {
        self.state().fail_delete.insert(handle);
    }

    pub(crate) fn fail_wait_for(&self, job_id: &str) {
        self.state().fail_wait.insert(job_id.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<SessionCall> {
        self.state().calls.clone()
    }

    pub(crate) fn submitted(&self) -> Vec<JobTemplate> {
        self.state().submitted.clone()
    }

    pub(crate) fn live_templates(&self) -> usize {
        self.state().live_templates.len()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state().open
    }

    pub(crate) fn max_concurrent_submissions(&self) -> usize {
        self.max_in_submission.load(Ordering::SeqCst)
    }

    fn record_submission(&self, template: &JobTemplate) -> Result<u64> {
        let delay = {
            let state = self.state();
            if !state.open {
                return Err(PiperError::Session("session is not open".to_string()));
            }
            if state.fail_submit {
                return Err(PiperError::Session("denied: queue disabled".to_string()));
            }
            state.submission_delay
        };
        let now = self.in_submission.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_submission.fetch_max(now, Ordering::SeqCst);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut state = self.state();
        state.submitted.push(template.clone());
        state.next_job += 1;
        let job = state.next_job;
        drop(state);
        self.in_submission.fetch_sub(1, Ordering::SeqCst);
        Ok(job)
    }
}

impl DrmSession for FakeSession {
    fn contact(&self) -> String {
        "fake".to_string()
    }

    fn initialize(&self) -> Result<()> {
        let mut state = self.state();
        state.calls.push(SessionCall::Initialize);
        if state.fail_init {
            return Err(PiperError::BackendUnavailable(
                "no scheduler reachable".to_string(),
            ));
        }
        state.open = true;
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        let mut state = self.state();
        state.calls.push(SessionCall::Exit);
        state.open = false;
        if state.fail_exit {
            return Err(PiperError::Session("exit refused".to_string()));
        }
        Ok(())
    }

    fn create_job_template(&self) -> Result<JobTemplate> {
        let mut state = self.state();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.calls.push(SessionCall::CreateTemplate(handle));
        state.live_templates.insert(handle);
        Ok(JobTemplate {
            handle,
            ..JobTemplate::default()
        })
    }

    fn delete_job_template(&self, template: &JobTemplate) -> Result<()> {
        let mut state = self.state();
        state.calls.push(SessionCall::DeleteTemplate(template.handle));
        if state.fail_delete.contains(&template.handle) {
            return Err(PiperError::Session(format!(
                "template {} is busy",
                template.handle
            )));
        }
        state.live_templates.remove(&template.handle);
        Ok(())
    }

    fn run_job(&self, template: &JobTemplate) -> Result<JobId> {
        let job_id = self.record_submission(template)?.to_string();
        self.state().calls.push(SessionCall::RunJob(job_id.clone()));
        Ok(job_id)
    }

    fn run_bulk_jobs(&self, template: &JobTemplate, range: TaskRange) -> Result<Vec<JobId>> {
        let base = self.record_submission(template)?;
        let ids: Vec<JobId> = range.tasks().map(|t| format!("{}.{}", base, t)).collect();
        self.state().calls.push(SessionCall::RunBulk(ids.clone()));
        Ok(ids)
    }

    fn job_status(&self, job_id: &str) -> Result<JobState> {
        let mut state = self.state();
        state.calls.push(SessionCall::Status(job_id.to_string()));
        if state.fail_status {
            return Err(PiperError::Session("qmaster unreachable".to_string()));
        }
        Ok(JobState::Running)
    }

    fn wait(&self, job_id: &str, _timeout: WaitTimeout) -> Result<JobInfo> {
        let mut state = self.state();
        state.calls.push(SessionCall::Wait(job_id.to_string()));
        if state.fail_wait.contains(job_id) {
            return Err(PiperError::Session(format!("job {} vanished", job_id)));
        }
        Ok(JobInfo {
            job_id: job_id.to_string(),
            has_exited: true,
            has_signal: false,
            was_aborted: false,
            exit_status: state.exit_status,
            resource_usage: state.usage.clone(),
        })
    }

    fn synchronize(&self, job_ids: &[JobId], _timeout: WaitTimeout, dispose: bool) -> Result<()> {
        self.state().calls.push(SessionCall::Synchronize {
            ids: job_ids.to_vec(),
            dispose,
        });
        Ok(())
    }
}
