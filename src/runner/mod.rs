//! Stage runners: execute one stage for a chapter set and report how it went.
//!
//! A runner is the only place retries happen. The orchestrator invokes a
//! runner once per stage and waits for its [`StageOutcome`]; it never
//! retries across stages.
//!
//! * [`LocalStageRunner`]: in-process, chapters fanned out on the current
//!   tokio task with bounded concurrency.
//! * [`CommandStageRunner`]: one child process per invocation (normally
//!   `scan2md stage`), configured purely through environment variables and
//!   reporting through its exit code. The local analogue of a container
//!   task.

mod command;
mod local;

pub use command::CommandStageRunner;
pub use local::LocalStageRunner;

use crate::config::StageSettings;
use crate::error::{ErrorKind, PipelineError, StageError};
use crate::model::{ChapterId, JobId, RunId, StageName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ── Worker environment protocol ──────────────────────────────────────────

pub const ENV_STAGE: &str = "SCAN2MD_STAGE";
pub const ENV_JOB_ID: &str = "SCAN2MD_JOB_ID";
pub const ENV_CHAPTERS: &str = "SCAN2MD_CHAPTERS";
pub const ENV_STORE: &str = "SCAN2MD_STORE";
pub const ENV_STAGE_SETTINGS: &str = "SCAN2MD_STAGE_SETTINGS";
pub const ENV_RUN_ID: &str = "SCAN2MD_RUN_ID";

/// Prefix of the stderr line on which a failing worker reports its
/// [`StageFailure`] as JSON.
pub const FAILURE_MARKER: &str = "scan2md-failure: ";

/// One stage invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRequest {
    pub stage: StageName,
    pub job_id: JobId,
    pub chapters: Vec<ChapterId>,
    /// Run the invocation belongs to; `None` outside an orchestrated run.
    pub run_id: Option<RunId>,
    /// Extra environment for the invocation. Child-process runners export
    /// it; the in-process runner has no environment of its own.
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failure,
}

/// Why a stage invocation failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: ErrorKind,
    /// First failing chapter in chapter order, if the failure is
    /// attributable to one.
    pub chapter: Option<ChapterId>,
    pub message: String,
    /// Whether another attempt could succeed.
    #[serde(default)]
    pub transient: bool,
}

impl From<&StageError> for StageFailure {
    fn from(e: &StageError) -> Self {
        Self {
            kind: e.kind(),
            chapter: e.chapter().cloned(),
            message: e.to_string(),
            transient: e.is_transient(),
        }
    }
}

impl StageFailure {
    pub fn runner(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::StageRunner,
            chapter: None,
            message: message.into(),
            transient: false,
        }
    }

    /// Line a worker prints on stderr before exiting non-zero.
    pub fn to_marker_line(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"kind":"stage_runner","chapter":null,"message":{:?}}}"#,
                self.message
            )
        });
        format!("{FAILURE_MARKER}{json}")
    }

    /// Last failure marker in a worker's stderr, if any.
    pub fn from_stderr(stderr: &str) -> Option<Self> {
        stderr
            .lines()
            .rev()
            .find_map(|l| l.trim().strip_prefix(FAILURE_MARKER.trim_end()))
            .and_then(|json| serde_json::from_str(json.trim()).ok())
    }
}

/// Exit information of a stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Worker exit code (0 on success), or the code an isolated worker would
    /// have used for the same failure.
    pub code: i32,
    /// Attempts used by the most-retried unit of work.
    pub attempts: u32,
    pub duration_ms: u64,
    pub failure: Option<StageFailure>,
}

/// Result of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub exit: ExitInfo,
}

impl StageOutcome {
    pub fn success(attempts: u32, duration_ms: u64) -> Self {
        Self {
            status: StageStatus::Success,
            exit: ExitInfo {
                code: 0,
                attempts,
                duration_ms,
                failure: None,
            },
        }
    }

    pub fn failure(code: i32, failure: StageFailure, attempts: u32, duration_ms: u64) -> Self {
        Self {
            status: StageStatus::Failure,
            exit: ExitInfo {
                code,
                attempts,
                duration_ms,
                failure: Some(failure),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Success
    }
}

/// Executes one stage for a chapter set.
///
/// `invoke` never returns an error: infrastructure problems (a worker that
/// could not start, a crash) are failures with kind
/// [`ErrorKind::StageRunner`].
#[async_trait]
pub trait StageRunner: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: StageRequest) -> StageOutcome;
}

/// Everything an isolated worker reads from its environment.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub request: StageRequest,
    pub store: PathBuf,
    pub settings: StageSettings,
}

impl WorkerEnv {
    /// Read the worker protocol from the process environment.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| PipelineError::InvalidConfig(format!("{key} is not set")))
        };

        let stage = required(ENV_STAGE)?.parse::<StageName>()?;
        let job_id = JobId::new(required(ENV_JOB_ID)?.trim())?;
        let chapters = lookup(ENV_CHAPTERS)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ChapterId::new)
            .collect::<Result<Vec<_>, _>>()?;
        let run_id = match lookup(ENV_RUN_ID) {
            Some(raw) if !raw.trim().is_empty() => Some(raw.trim().parse::<RunId>().map_err(|e| {
                PipelineError::InvalidConfig(format!("{ENV_RUN_ID} is not a run id: {e}"))
            })?),
            _ => None,
        };
        let store = PathBuf::from(required(ENV_STORE)?);
        let settings = match lookup(ENV_STAGE_SETTINGS) {
            Some(raw) if !raw.trim().is_empty() => StageSettings::from_env_value(&raw)?,
            _ => StageSettings::default(),
        };

        Ok(Self {
            request: StageRequest {
                stage,
                job_id,
                chapters,
                run_id,
                environment: BTreeMap::new(),
            },
            store,
            settings,
        })
    }

    /// The variables a runner exports for this worker.
    pub fn to_vars(&self) -> Result<Vec<(String, String)>, PipelineError> {
        let chapters = self
            .request
            .chapters
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let mut vars = vec![
            (ENV_STAGE.into(), self.request.stage.to_string()),
            (ENV_JOB_ID.into(), self.request.job_id.to_string()),
            (ENV_CHAPTERS.into(), chapters),
            (ENV_STORE.into(), self.store.to_string_lossy().into_owned()),
            (ENV_STAGE_SETTINGS.into(), self.settings.to_env_value()?),
        ];
        if let Some(run_id) = self.request.run_id {
            vars.push((ENV_RUN_ID.into(), run_id.to_string()));
        }
        Ok(vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn failure_marker_round_trip() {
        let failure = StageFailure {
            kind: ErrorKind::Extraction,
            chapter: Some(ChapterId::new("02").unwrap()),
            message: "page 1 unreadable".into(),
            transient: false,
        };
        let stderr = format!("some log line\n{}\n", failure.to_marker_line());
        assert_eq!(StageFailure::from_stderr(&stderr), Some(failure));
        assert_eq!(StageFailure::from_stderr("panicked at ..."), None);
    }

    #[test]
    fn stage_error_converts_to_failure() {
        let e = StageError::OcrFailed {
            chapter: ChapterId::new("03").unwrap(),
            page: 0,
            detail: "503".into(),
            transient: true,
        };
        let f = StageFailure::from(&e);
        assert_eq!(f.kind, ErrorKind::Extraction);
        assert_eq!(f.chapter.as_ref().map(|c| c.as_str()), Some("03"));
        assert!(f.transient);
    }

    #[test]
    fn worker_env_round_trip() {
        let env = WorkerEnv {
            request: StageRequest {
                stage: StageName::Markdown,
                job_id: JobId::new("manual").unwrap(),
                chapters: vec![ChapterId::new("01").unwrap(), ChapterId::new("02").unwrap()],
                run_id: Some(RunId::generate()),
                environment: BTreeMap::new(),
            },
            store: PathBuf::from("/tmp/store"),
            settings: StageSettings {
                number_chapters: true,
                ..StageSettings::default()
            },
        };
        let vars: HashMap<String, String> = env.to_vars().unwrap().into_iter().collect();
        assert_eq!(vars[ENV_CHAPTERS], "01,02");

        let back = WorkerEnv::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(back.request, env.request);
        assert_eq!(back.store, env.store);
        assert_eq!(back.settings, env.settings);
    }

    #[test]
    fn worker_env_requires_stage_and_job() {
        let err = WorkerEnv::from_lookup(|_| None).unwrap_err();
        assert!(err.to_string().contains(ENV_STAGE), "got: {err}");

        let bad_chapter = WorkerEnv::from_lookup(|k| match k {
            ENV_STAGE => Some("ocr".into()),
            ENV_JOB_ID => Some("j".into()),
            ENV_CHAPTERS => Some("01,../x".into()),
            ENV_STORE => Some("/tmp/s".into()),
            _ => None,
        });
        assert!(bad_chapter.is_err());

        let bad_run = WorkerEnv::from_lookup(|k| match k {
            ENV_STAGE => Some("final".into()),
            ENV_JOB_ID => Some("j".into()),
            ENV_STORE => Some("/tmp/s".into()),
            ENV_RUN_ID => Some("not-a-uuid".into()),
            _ => None,
        })
        .unwrap_err();
        assert!(bad_run.to_string().contains(ENV_RUN_ID), "got: {bad_run}");
    }
}
