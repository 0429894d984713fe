use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PiperError>;

#[derive(Debug, Error)]
pub enum PiperError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("grid backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Scheduler interaction failed (submission, status, wait, template handling).
    #[error("session error: {0}")]
    Session(String),

    #[error("input path is not a file: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("output path is not a file: {} - job failed?", .0.display())]
    MissingOutput(PathBuf),

    #[error("output dir is not a folder: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("{0}")]
    Arity(String),

    #[error("no output files produced by command {command} with filter pattern {pattern}")]
    NoPatternOutput { command: String, pattern: String },

    #[error("no files collected starting at top folder {}", .0.display())]
    NothingCollected(PathBuf),

    #[error("invalid command template: {0}")]
    Template(String),

    /// Failure keywords were found on stderr of an otherwise completed job.
    #[error("job signalled failure: {0}")]
    Signalled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PiperError {
    /// True for violated input/output pre- and post-conditions.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            PiperError::MissingInput(_)
                | PiperError::MissingOutput(_)
                | PiperError::NotADirectory(_)
                | PiperError::Arity(_)
                | PiperError::NoPatternOutput { .. }
                | PiperError::NothingCollected(_)
                | PiperError::Template(_)
        )
    }

    pub fn is_signalled(&self) -> bool {
        matches!(self, PiperError::Signalled(_))
    }
}
