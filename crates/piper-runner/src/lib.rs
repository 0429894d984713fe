//! Job execution for pipeline steps: run shell commands locally or on a
//! Grid Engine cluster, and wrap them in input/output contracts.

pub mod activation;
pub mod config;
pub mod contracts;
pub mod drm;
pub mod error;
pub mod grid;
pub mod local;
pub mod manager;
pub mod result;

#[cfg(test)]
mod testing;

pub use activation::{with_activation, CallOptions};
pub use config::{load_options, ConfigMap, EnvMap, JobConfig};
pub use contracts::{
    check_job, format_command, in_out, in_out_ref, in_outpair, in_pat, inpair_out, inref_out,
    ins_out, ins_out_ref, ins_pat, recursive_collect, run_contract, run_raw, ContractArgs,
    ContractKind, Inputs, JobCheck, PatternOutput, StepOutcome, Substitution,
};
pub use drm::sge::SgeSession;
pub use drm::{DrmSession, JobInfo, JobState, JobTemplate, TaskRange, WaitTimeout};
pub use error::{PiperError, Result};
pub use manager::{ArgvJob, BackendSelection, BoundArgvJob, BoundJob, JobManager};
pub use result::{JobCallable, JobOutput, JobResult};
