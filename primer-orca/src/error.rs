use thiserror::Error;

/// Why an attempt did not complete.
///
/// Every variant is written to the attempt's run log before it is returned.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("job is already completed")]
    AlreadyCompleted,
    #[error("max runs reached ({runs} runs, {retries} retries)")]
    MaxRunsReached { runs: usize, retries: u32 },
    #[error("optimizer exited with code {code}")]
    ProcessExit { code: i32 },
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl AttemptError {
    /// Whether the task queue should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AttemptError::ProcessExit { .. } | AttemptError::Unexpected(_)
        )
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptError::AlreadyCompleted => "already_completed",
            AttemptError::MaxRunsReached { .. } => "max_runs_reached",
            AttemptError::ProcessExit { .. } => "process_exit",
            AttemptError::Unexpected(_) => "unexpected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_execution_faults_are_retryable() {
        assert!(!AttemptError::AlreadyCompleted.is_retryable());
        assert!(
            !AttemptError::MaxRunsReached {
                runs: 6,
                retries: 0
            }
            .is_retryable()
        );
        assert!(AttemptError::ProcessExit { code: 1 }.is_retryable());
        assert!(AttemptError::from(anyhow::anyhow!("disk full")).is_retryable());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            AttemptError::ProcessExit { code: -9 }.to_string(),
            "optimizer exited with code -9"
        );
        assert_eq!(
            AttemptError::Unexpected(anyhow::anyhow!("disk full")).to_string(),
            "disk full"
        );
    }
}
