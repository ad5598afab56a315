//! Execution result of a single task invocation and its persisted record.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{RESULT_VERSION, TERMINATED_BEFORE_COMPLETION};
use crate::types::{OutputRef, PackagePins};

/// What happened to the task itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskResult {
    /// `None` until the child has started
    pub exit_code: Option<i32>,
    pub had_hard_timeout: bool,
}

/// The agent's own machinery failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentError {
    pub message: String,
    /// Whatever was learned about the task before the failure
    pub task: Option<TaskResult>,
}

/// Task failure and agent failure are never conflated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Task(TaskResult),
    Agent(AgentError),
}

impl Outcome {
    /// Exit code of the task if it got far enough to have one
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Outcome::Task(task) => task.exit_code,
            Outcome::Agent(err) => err.task.and_then(|t| t.exit_code),
        }
    }

    #[must_use]
    pub fn had_hard_timeout(&self) -> bool {
        match self {
            Outcome::Task(task) => task.had_hard_timeout,
            Outcome::Agent(err) => err.task.is_some_and(|t| t.had_hard_timeout),
        }
    }

    #[must_use]
    pub fn internal_failure(&self) -> Option<&str> {
        match self {
            Outcome::Task(_) => None,
            Outcome::Agent(err) => Some(&err.message),
        }
    }

    /// Raise the exit code to at least 1 unless a non-zero code is already set
    pub fn apply_exit_code_floor(&mut self) {
        let task = match self {
            Outcome::Task(task) => task,
            Outcome::Agent(err) => err.task.get_or_insert_with(TaskResult::default),
        };
        if matches!(task.exit_code, None | Some(0)) {
            task.exit_code = Some(1);
        }
    }
}

/// Timing and item bookkeeping for a fetch or an upload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferStats {
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Items that had to cross the wire
    pub items_cold: u64,
    /// Items already present on the other side
    pub items_hot: u64,
    /// Bytes that had to cross the wire
    pub bytes_cold: u64,
    pub bytes_hot: u64,
}

/// Package installer timing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageStats {
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    #[serde(with = "duration_secs")]
    pub get_client_duration: Duration,
}

/// Named cache install/uninstall timing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedCacheStats {
    #[serde(with = "duration_secs")]
    pub install: Duration,
    #[serde(with = "duration_secs")]
    pub uninstall: Duration,
    /// Caches that could not be returned to the pool
    pub lost: Vec<String>,
}

/// Structured statistics collected over one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<TransferStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<TransferStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packages: Option<PackageStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub named_caches: Option<NamedCacheStats>,
}

/// Result of one invocation, filled in incrementally as phases complete
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub duration: Duration,
    pub outcome: Outcome,
    pub outputs_ref: Option<OutputRef>,
    pub package_pins: PackagePins,
    pub stats: RunStats,
}

impl ExecutionResult {
    /// Result describing a run that has not completed yet.
    ///
    /// Persisted before execution so that a crash leaves an agent failure
    /// behind rather than nothing.
    #[must_use]
    pub fn speculative() -> Self {
        Self {
            duration: Duration::ZERO,
            outcome: Outcome::Agent(AgentError {
                message: TERMINATED_BEFORE_COMPLETION.to_string(),
                task: None,
            }),
            outputs_ref: None,
            package_pins: PackagePins::default(),
            stats: RunStats::default(),
        }
    }

    /// Flat structured record written to the result file
    #[must_use]
    pub fn to_record(&self) -> ResultRecord {
        ResultRecord {
            version: RESULT_VERSION,
            duration: self.duration.as_secs_f64(),
            exit_code: self.outcome.exit_code(),
            had_hard_timeout: self.outcome.had_hard_timeout(),
            internal_failure: self.outcome.internal_failure().map(str::to_string),
            outputs_ref: self.outputs_ref.clone(),
            package_pins: self.package_pins.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Exit code for the agent process itself.
    ///
    /// With a result file, task failures live in the file and only agent
    /// failures make the process exit non-zero. Without one, the task's own
    /// code is surfaced, or 1 when it never started.
    #[must_use]
    pub fn process_exit_code(&self, result_file_requested: bool) -> i32 {
        if result_file_requested {
            return i32::from(self.outcome.internal_failure().is_some());
        }
        match self.outcome.exit_code() {
            Some(code) if self.outcome.internal_failure().is_none() => code,
            Some(code) if code != 0 => code,
            _ => 1,
        }
    }
}

/// On-disk form of [`ExecutionResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub version: u32,
    pub duration: f64,
    pub exit_code: Option<i32>,
    pub had_hard_timeout: bool,
    pub internal_failure: Option<String>,
    pub outputs_ref: Option<OutputRef>,
    pub package_pins: PackagePins,
    pub stats: RunStats,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(exit_code: Option<i32>) -> ExecutionResult {
        ExecutionResult {
            outcome: Outcome::Task(TaskResult {
                exit_code,
                had_hard_timeout: false,
            }),
            ..ExecutionResult::speculative()
        }
    }

    #[test]
    fn test_speculative_record_reports_termination() {
        let record = ExecutionResult::speculative().to_record();
        assert_eq!(
            record.internal_failure.as_deref(),
            Some(TERMINATED_BEFORE_COMPLETION)
        );
        assert_eq!(record.exit_code, None);
        assert!(!record.had_hard_timeout);
    }

    #[test]
    fn test_exit_code_floor() {
        let mut outcome = Outcome::Task(TaskResult::default());
        outcome.apply_exit_code_floor();
        assert_eq!(outcome.exit_code(), Some(1));

        let mut outcome = Outcome::Task(TaskResult {
            exit_code: Some(0),
            had_hard_timeout: false,
        });
        outcome.apply_exit_code_floor();
        assert_eq!(outcome.exit_code(), Some(1));

        let mut outcome = Outcome::Task(TaskResult {
            exit_code: Some(-9),
            had_hard_timeout: true,
        });
        outcome.apply_exit_code_floor();
        assert_eq!(outcome.exit_code(), Some(-9));
    }

    #[test]
    fn test_process_exit_code_with_result_file() {
        assert_eq!(task(Some(3)).process_exit_code(true), 0);
        assert_eq!(ExecutionResult::speculative().process_exit_code(true), 1);
    }

    #[test]
    fn test_process_exit_code_without_result_file() {
        assert_eq!(task(Some(3)).process_exit_code(false), 3);
        assert_eq!(task(Some(0)).process_exit_code(false), 0);
        assert_eq!(task(None).process_exit_code(false), 1);
        assert_eq!(ExecutionResult::speculative().process_exit_code(false), 1);
    }

    #[test]
    fn test_record_serializes_durations_as_seconds() {
        let mut result = task(Some(0));
        result.stats.download = Some(TransferStats {
            duration: Duration::from_millis(1500),
            items_cold: 2,
            ..TransferStats::default()
        });
        let value = serde_json::to_value(result.to_record()).unwrap();
        assert_eq!(value["stats"]["download"]["duration"], 1.5);
        assert_eq!(value["stats"]["download"]["items_cold"], 2);
        assert!(value["stats"].get("upload").is_none());
        assert!(value["internal_failure"].is_null());

        let back: ResultRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.exit_code, Some(0));
    }
}
