//! `git` command-line source with a hard time bound per query.

use crate::{MetadataSource, SourceError};
use std::io::{self, Read};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Queries a working tree by running `git rev-parse`.
#[derive(Clone, Debug)]
pub struct GitCli {
    program: PathBuf,
    work_dir: PathBuf,
    timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new(".")
    }
}

impl GitCli {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("git"),
            work_dir: work_dir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn rev_parse(&self, args: &[&str]) -> Result<String, SourceError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("rev-parse").args(args).current_dir(&self.work_dir);
        let stdout = run_with_timeout(cmd, self.timeout)?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

impl MetadataSource for GitCli {
    fn short_revision(&self) -> Result<String, SourceError> {
        self.rev_parse(&["--short", "HEAD"])
    }

    fn symbolic_ref(&self) -> Result<String, SourceError> {
        self.rev_parse(&["--abbrev-ref", "HEAD"])
    }
}

/// Files under `git_dir` whose change means `HEAD` moved: `HEAD` itself,
/// its reflog, the packed refs, and the loose ref of the checked-out branch.
/// A build script prints these as `rerun-if-changed` so that commits and
/// branch switches both re-stamp.
pub fn head_watch_paths(git_dir: &Path) -> Vec<PathBuf> {
    let head = git_dir.join("HEAD");
    let mut paths = vec![
        head.clone(),
        git_dir.join("logs").join("HEAD"),
        git_dir.join("packed-refs"),
    ];
    if let Ok(contents) = fs::read_to_string(&head) {
        if let Some(reference) = contents.trim().strip_prefix("ref: ") {
            paths.push(git_dir.join(reference));
        }
    }
    paths
}

/// Runs `cmd` without stdin and returns its stdout if it exits successfully
/// within `timeout`. A child still running at the deadline is killed.
///
/// Both pipes are drained on reader threads while the child runs, and
/// collecting their output counts against the same deadline, so neither a
/// chatty child nor a grandchild holding the pipes open can outlast it.
pub(crate) fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<Vec<u8>, SourceError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|source| SourceError::Spawn { program, source })?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SourceError::Timeout(timeout));
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = collect(&stdout, deadline, timeout)?;
    let stderr = collect(&stderr, deadline, timeout)?;
    if !status.success() {
        return Err(SourceError::Failed {
            code: status.code(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        });
    }
    Ok(stdout)
}

type Drained = Receiver<io::Result<Vec<u8>>>;

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Drained {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let res = match pipe {
            Some(mut pipe) => pipe.read_to_end(&mut buf).map(|_| buf),
            None => Ok(buf),
        };
        let _ = tx.send(res);
    });
    rx
}

fn collect(rx: &Drained, deadline: Instant, timeout: Duration) -> Result<Vec<u8>, SourceError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(remaining) {
        Ok(res) => Ok(res?),
        // The reader is abandoned; it exits once the last writer closes.
        Err(_) => Err(SourceError::Timeout(timeout)),
    }
}
