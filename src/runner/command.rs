//! Child-process stage runner.

use super::{
    StageFailure, StageOutcome, StageRequest, StageRunner, WorkerEnv, FAILURE_MARKER,
};
use crate::config::{retry_delay, PipelineConfig, StageSettings};
use crate::error::{ErrorKind, STORE_EXIT_CODE};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Runs each stage invocation as a child process.
///
/// The worker receives the protocol variables (`SCAN2MD_STAGE`,
/// `SCAN2MD_JOB_ID`, `SCAN2MD_CHAPTERS`, `SCAN2MD_STORE`,
/// `SCAN2MD_STAGE_SETTINGS`, and `SCAN2MD_RUN_ID` inside a run) plus the request's environment, and must exit
/// with `0` on success or the code of the failure's
/// [`ErrorKind`]. A failing worker may print a [`FAILURE_MARKER`] line on
/// stderr to name the failing chapter; otherwise only the exit code is known.
///
/// The child is killed if the invocation is dropped (stage timeout or
/// cancellation). Failures marked transient, and store failures (exit code
/// 13), are retried by relaunching the worker.
#[derive(Debug, Clone)]
pub struct CommandStageRunner {
    program: PathBuf,
    args: Vec<OsString>,
    store: PathBuf,
    settings: StageSettings,
    environment: BTreeMap<String, String>,
    retry_budget: u32,
    retry_backoff_ms: u64,
}

impl CommandStageRunner {
    /// `program args...` will be launched for every invocation; `store` is
    /// the [`crate::store::FsStore`] root the worker must open.
    pub fn new(program: impl Into<PathBuf>, store: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            store: store.into(),
            settings: StageSettings::default(),
            environment: BTreeMap::new(),
            retry_budget: 0,
            retry_backoff_ms: 0,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn settings(mut self, settings: StageSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Take stage settings, retry policy and environment from `config`.
    pub fn with_config(mut self, config: &PipelineConfig) -> Self {
        self.settings = config.stage.clone();
        self.environment = config.environment.clone();
        self.retry_budget = config.retry_budget;
        self.retry_backoff_ms = config.retry_backoff_ms;
        self
    }

    pub fn with_retry(mut self, budget: u32, backoff_ms: u64) -> Self {
        self.retry_budget = budget;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    async fn launch(&self, request: &StageRequest) -> Result<(), (i32, StageFailure)> {
        let worker = WorkerEnv {
            request: request.clone(),
            store: self.store.clone(),
            settings: self.settings.clone(),
        };
        let vars = worker
            .to_vars()
            .map_err(|e| (ErrorKind::StageRunner.exit_code(), StageFailure::runner(e.to_string())))?;

        let output = Command::new(&self.program)
            .args(&self.args)
            .envs(self.environment.iter())
            .envs(request.environment.iter())
            .envs(vars)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                (
                    ErrorKind::StageRunner.exit_code(),
                    StageFailure::runner(format!(
                        "could not launch worker '{}': {e}",
                        self.program.display()
                    )),
                )
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim_start().starts_with(FAILURE_MARKER.trim_end())) {
            debug!("worker: {}", line);
        }

        let Some(code) = output.status.code() else {
            return Err((
                ErrorKind::StageRunner.exit_code(),
                StageFailure::runner("worker was terminated by a signal"),
            ));
        };
        if code == 0 {
            return Ok(());
        }

        let kind = ErrorKind::from_exit_code(code).unwrap_or(ErrorKind::StageRunner);
        let failure = match StageFailure::from_stderr(&stderr) {
            Some(mut reported) => {
                // The exit code is authoritative for the kind.
                reported.kind = kind;
                reported.transient |= code == STORE_EXIT_CODE;
                reported
            }
            None => StageFailure {
                kind,
                chapter: None,
                message: stderr
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .map(|l| l.trim().to_string())
                    .unwrap_or_else(|| format!("worker exited with code {code}")),
                transient: code == STORE_EXIT_CODE,
            },
        };
        Err((code, failure))
    }
}

#[async_trait]
impl StageRunner for CommandStageRunner {
    fn name(&self) -> &str {
        "command"
    }

    async fn invoke(&self, request: StageRequest) -> StageOutcome {
        let start = Instant::now();
        info!(
            "{} stage: job {} ({} chapters, worker {})",
            request.stage,
            request.job_id,
            request.chapters.len(),
            self.program.display()
        );

        let mut attempt = 1;
        loop {
            match self.launch(&request).await {
                Ok(()) => {
                    return StageOutcome::success(attempt, start.elapsed().as_millis() as u64)
                }
                Err((_, failure)) if failure.transient && attempt <= self.retry_budget => {
                    let delay = retry_delay(self.retry_backoff_ms, attempt);
                    attempt += 1;
                    warn!(
                        "{} stage: relaunching worker (attempt {}/{}) after {}ms: {}",
                        request.stage,
                        attempt,
                        self.retry_budget + 1,
                        delay.as_millis(),
                        failure.message
                    );
                    tokio::time::sleep(delay).await;
                }
                Err((code, failure)) => {
                    return StageOutcome::failure(
                        code,
                        failure,
                        attempt,
                        start.elapsed().as_millis() as u64,
                    )
                }
            }
        }
    }
}
