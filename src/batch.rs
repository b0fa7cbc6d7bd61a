//! Batch backend that runs the model binary as a local child process.
//!
//! The binary is started with the path of the job description as its only
//! argument and must write the job report into the run directory before it
//! exits. Jobs started by an earlier process are tracked through their report
//! file alone.

use crate::error::{EngineError, Result};
use crate::job::{read_report, BatchSystem, JobDescription, JobReport, JobState, JOB_OPTIONS_FILE};
use crate::store::Store;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

const STDOUT_FILE: &str = "job_output.txt";
const STDERR_FILE: &str = "job_error.txt";

pub struct ProcessBatch {
    executable: PathBuf,
    poll_interval: Duration,
    children: Mutex<HashMap<PathBuf, Child>>,
}

impl ProcessBatch {
    pub fn new(executable: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            executable: executable.into(),
            poll_interval,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn physical_dir(store: &dyn Store, run: &Path) -> Result<PathBuf> {
        store.locate(run).ok_or_else(|| {
            EngineError::Validation(
                "the process batch backend needs a filesystem store".to_string(),
            )
        })
    }

    fn diagnostic(dir: &Path, fallback: String) -> String {
        match std::fs::read_to_string(dir.join(STDERR_FILE)) {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => fallback,
        }
    }

    fn state_from_report(store: &dyn Store, run: &Path) -> Result<Option<JobState>> {
        Ok(read_report(store, run)?.map(|report| {
            if report.succeeded() {
                JobState::Finished(report)
            } else {
                JobState::Failed(report.diagnostic)
            }
        }))
    }
}

impl BatchSystem for ProcessBatch {
    fn submit(&self, store: &dyn Store, run: &Path, _description: &JobDescription) -> Result<()> {
        let dir = Self::physical_dir(store, run)?;
        let stdout = File::create(dir.join(STDOUT_FILE)).map_err(|e| EngineError::io(&dir, e))?;
        let stderr = File::create(dir.join(STDERR_FILE)).map_err(|e| EngineError::io(&dir, e))?;
        let child = Command::new(&self.executable)
            .arg(dir.join(JOB_OPTIONS_FILE))
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| EngineError::io(&self.executable, e))?;
        info!(run = %run.display(), pid = child.id(), "job started");
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run.to_path_buf(), child);
        Ok(())
    }

    fn poll(&self, store: &dyn Store, run: &Path) -> Result<JobState> {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(child) = children.get_mut(run) else {
            drop(children);
            return Ok(Self::state_from_report(store, run)?.unwrap_or(JobState::Running));
        };

        let dir = Self::physical_dir(store, run)?;
        let status = match child.try_wait().map_err(|e| EngineError::io(&dir, e))? {
            Some(status) => status,
            None => return Ok(JobState::Running),
        };
        children.remove(run);
        drop(children);
        debug!(run = %run.display(), %status, "job process exited");

        if !status.success() {
            return Ok(JobState::Failed(Self::diagnostic(
                &dir,
                format!("model process exited with {}", status),
            )));
        }
        Ok(Self::state_from_report(store, run)?.unwrap_or_else(|| {
            JobState::Failed(Self::diagnostic(
                &dir,
                "model process exited without writing a job report".to_string(),
            ))
        }))
    }

    fn wait(&self, store: &dyn Store, run: &Path) -> Result<JobReport> {
        loop {
            match self.poll(store, run)? {
                JobState::Running => thread::sleep(self.poll_interval),
                JobState::Finished(report) => return Ok(report),
                JobState::Failed(diagnostic) => {
                    return Err(EngineError::ExternalJobFailure {
                        dir: run.to_path_buf(),
                        diagnostic,
                    })
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::job::{Job, JOB_REPORT_FILE};
    use crate::store::FsStore;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("model.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn description() -> JobDescription {
        JobDescription {
            model_name: "dop".to_string(),
            parameters: vec![0.02],
            years: 10,
            tolerance: 0.0,
            time_step: 1,
            concentration_factor: 1.0,
            write_trajectory: false,
            tracer_input_dir: None,
            setup: Default::default(),
        }
    }

    #[test]
    fn test_successful_job() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(
            tmp.path(),
            &format!(
                "echo '{{\"exit_code\":0,\"last_year\":10,\"last_tolerance\":0.5}}' > {}",
                JOB_REPORT_FILE
            ),
        );
        let store = FsStore::new(tmp.path().join("db"));
        let run = Path::new("spinup/run_00");
        store.create_dir(run).unwrap();

        let batch = ProcessBatch::new(exe, Duration::from_millis(10));
        let mut job = Job::new(&store, run);
        job.write_description(description()).unwrap();
        job.launch(&batch).unwrap();
        let report = job.wait_until_finished(&batch).unwrap();
        assert_eq!(report.last_year, 10);
        assert_eq!(job.last_tolerance().unwrap(), 0.5);
    }

    #[test]
    fn test_failed_job_passes_diagnostic_through() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "echo 'out of memory on node 7' >&2\nexit 3");
        let store = FsStore::new(tmp.path().join("db"));
        let run = Path::new("spinup/run_00");
        store.create_dir(run).unwrap();

        let batch = ProcessBatch::new(exe, Duration::from_millis(10));
        let mut job = Job::new(&store, run);
        job.write_description(description()).unwrap();
        job.launch(&batch).unwrap();
        match job.wait_until_finished(&batch) {
            Err(EngineError::ExternalJobFailure { diagnostic, .. }) => {
                assert_eq!(diagnostic, "out of memory on node 7");
            }
            other => panic!("expected job failure, got {:?}", other),
        }
    }

    #[test]
    fn test_requires_filesystem_store() {
        let store = crate::store::MemStore::new();
        let batch = ProcessBatch::new("/bin/true", Duration::from_millis(10));
        let err = batch
            .submit(&store, Path::new("run_00"), &description())
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
