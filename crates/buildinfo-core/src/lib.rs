#![deny(warnings)]

//! Build provenance for firmware images.
//!
//! Resolves the short revision, branch name and build timestamp of the
//! working tree. Resolution never fails: every source-control problem
//! collapses into a sentinel value so a pristine source tarball still
//! builds.

mod git;

pub use git::{head_watch_paths, GitCli, DEFAULT_GIT_TIMEOUT};

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Commit hash used when no revision can be queried.
pub const UNKNOWN_COMMIT: &str = "dev";
/// Branch name used when no branch can be queried.
pub const UNKNOWN_BRANCH: &str = "unknown";
/// Branch name reported for an anonymous checkout.
pub const DETACHED_BRANCH: &str = "detached";
/// Name git prints for the branch of a detached checkout.
const DETACHED_REF: &str = "HEAD";

/// `YYYYMMDD_HHMMSS`, sortable as plain text.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Define names, in the order they appear in generated output.
pub const FIELD_BUILD_NUMBER: &str = "FIRMWARE_BUILD_NUMBER";
pub const FIELD_BRANCH: &str = "GIT_BRANCH";
pub const FIELD_TIMESTAMP: &str = "BUILD_TIMESTAMP_NUM";

/// Failure of a single source-control query.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The query tool is missing or could not be started.
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The query did not finish in time and was killed.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    /// The query ran but reported failure.
    #[error("query exited with status {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    /// Waiting on the query or reading its output failed.
    #[error("query i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where revision metadata comes from.
pub trait MetadataSource {
    /// Abbreviated identifier of the checked-out revision.
    fn short_revision(&self) -> Result<String, SourceError>;
    /// Symbolic name of the checkout position (`HEAD` when detached).
    fn symbolic_ref(&self) -> Result<String, SourceError>;
}

/// Revision identity of the tree being built. Both fields are always set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RevisionInfo {
    pub commit_hash: String,
    pub branch: String,
}

/// Wall-clock time of the build formatted with [`TIMESTAMP_FORMAT`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct BuildTimestamp(String);

impl BuildTimestamp {
    /// Local system time, without timezone conversion.
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    pub fn from_datetime(at: NaiveDateTime) -> Self {
        Self(at.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything stamped into a firmware build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BuildMetadata {
    pub revision: RevisionInfo,
    pub timestamp: BuildTimestamp,
}

impl BuildMetadata {
    pub fn new(
        commit_hash: impl Into<String>,
        branch: impl Into<String>,
        timestamp: BuildTimestamp,
    ) -> Self {
        Self {
            revision: RevisionInfo {
                commit_hash: commit_hash.into(),
                branch: branch.into(),
            },
            timestamp,
        }
    }

    /// `(define name, value)` pairs in output order.
    pub fn fields(&self) -> [(&'static str, &str); 3] {
        [
            (FIELD_BUILD_NUMBER, self.revision.commit_hash.as_str()),
            (FIELD_BRANCH, self.revision.branch.as_str()),
            (FIELD_TIMESTAMP, self.timestamp.as_str()),
        ]
    }

    /// Compiler define flags, e.g. `-DGIT_BRANCH=\"main\"`, one per field.
    ///
    /// The quotes are escaped so the flags survive a shell-style split by the
    /// consuming build system.
    pub fn build_flags(&self) -> Vec<String> {
        self.fields()
            .iter()
            .map(|(name, value)| format!("-D{name}=\\\"{value}\\\""))
            .collect()
    }
}

/// Resolves metadata from a [`MetadataSource`], absorbing every failure.
pub struct Resolver<S> {
    source: S,
}

impl<S: MetadataSource> Resolver<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Trimmed short revision, or [`UNKNOWN_COMMIT`].
    pub fn resolve_commit_hash(&self) -> String {
        match self.source.short_revision() {
            Ok(hash) => hash.trim().to_string(),
            Err(err) => {
                debug!(error = %err, fallback = UNKNOWN_COMMIT, "revision query failed");
                UNKNOWN_COMMIT.to_string()
            }
        }
    }

    /// Trimmed branch name, [`DETACHED_BRANCH`] for a detached checkout, or
    /// [`UNKNOWN_BRANCH`].
    pub fn resolve_branch(&self) -> String {
        match self.source.symbolic_ref() {
            Ok(name) => {
                let name = name.trim();
                if name == DETACHED_REF {
                    DETACHED_BRANCH.to_string()
                } else {
                    name.to_string()
                }
            }
            Err(err) => {
                debug!(error = %err, fallback = UNKNOWN_BRANCH, "branch query failed");
                UNKNOWN_BRANCH.to_string()
            }
        }
    }

    pub fn resolve_revision(&self) -> RevisionInfo {
        RevisionInfo {
            commit_hash: self.resolve_commit_hash(),
            branch: self.resolve_branch(),
        }
    }

    pub fn resolve_build_timestamp(&self) -> BuildTimestamp {
        BuildTimestamp::now()
    }

    /// Revision plus a fresh timestamp.
    pub fn resolve(&self) -> BuildMetadata {
        BuildMetadata {
            revision: self.resolve_revision(),
            timestamp: self.resolve_build_timestamp(),
        }
    }
}

/// Short revision of the current directory via `git`.
pub fn resolve_commit_hash() -> String {
    Resolver::new(GitCli::default()).resolve_commit_hash()
}

/// Branch of the current directory via `git`.
pub fn resolve_branch() -> String {
    Resolver::new(GitCli::default()).resolve_branch()
}

pub fn resolve_build_timestamp() -> String {
    BuildTimestamp::now().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    #[derive(Clone, Copy, Debug)]
    enum Reply {
        Ok(&'static str),
        Missing,
        TimedOut,
        Failed,
        Broken,
    }

    impl Reply {
        fn into_result(self) -> Result<String, SourceError> {
            match self {
                Reply::Ok(s) => Ok(s.to_string()),
                Reply::Missing => Err(SourceError::Spawn {
                    program: "git".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
                Reply::TimedOut => Err(SourceError::Timeout(Duration::from_secs(5))),
                Reply::Failed => Err(SourceError::Failed {
                    code: Some(128),
                    stderr: "fatal: not a git repository".to_string(),
                }),
                Reply::Broken => Err(SourceError::Io(std::io::Error::from(
                    std::io::ErrorKind::BrokenPipe,
                ))),
            }
        }
    }

    struct FakeSource {
        revision: Reply,
        branch: Reply,
    }

    impl MetadataSource for FakeSource {
        fn short_revision(&self) -> Result<String, SourceError> {
            self.revision.into_result()
        }

        fn symbolic_ref(&self) -> Result<String, SourceError> {
            self.branch.into_result()
        }
    }

    fn resolver(revision: Reply, branch: Reply) -> Resolver<FakeSource> {
        Resolver::new(FakeSource { revision, branch })
    }

    fn failure() -> impl Strategy<Value = Reply> {
        prop_oneof![
            Just(Reply::Missing),
            Just(Reply::TimedOut),
            Just(Reply::Failed),
            Just(Reply::Broken),
        ]
    }

    #[test]
    fn passes_through_trimmed_values() {
        let r = resolver(Reply::Ok("abc123\n"), Reply::Ok("  main\n"));
        assert_eq!(
            r.resolve_revision(),
            RevisionInfo {
                commit_hash: "abc123".to_string(),
                branch: "main".to_string(),
            }
        );
    }

    #[test]
    fn detached_checkout_is_remapped() {
        let r = resolver(Reply::Ok("abc123"), Reply::Ok("HEAD\n"));
        assert_eq!(r.resolve_branch(), DETACHED_BRANCH);
    }

    #[test]
    fn branch_resembling_head_is_kept() {
        let r = resolver(Reply::Ok("abc123"), Reply::Ok("HEADS/feature"));
        assert_eq!(r.resolve_branch(), "HEADS/feature");
    }

    #[test]
    fn detached_differs_from_unavailable() {
        let detached = resolver(Reply::Missing, Reply::Ok("HEAD"));
        let missing = resolver(Reply::Missing, Reply::Missing);
        assert_ne!(detached.resolve_branch(), missing.resolve_branch());
    }

    #[test]
    fn queries_fall_back_independently() {
        let r = resolver(Reply::TimedOut, Reply::Ok("release/1.2"));
        let rev = r.resolve_revision();
        assert_eq!(rev.commit_hash, UNKNOWN_COMMIT);
        assert_eq!(rev.branch, "release/1.2");
    }

    #[test]
    fn timestamp_format_is_fixed() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(BuildTimestamp::from_datetime(at).as_str(), "20240101_120000");
    }

    #[test]
    fn current_timestamp_has_expected_shape() {
        let ts = resolve_build_timestamp();
        assert_eq!(ts.len(), 15);
        for (i, c) in ts.chars().enumerate() {
            if i == 8 {
                assert_eq!(c, '_');
            } else {
                assert!(c.is_ascii_digit(), "unexpected {c:?} in {ts}");
            }
        }
    }

    #[test]
    fn fields_are_ordered() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let meta = BuildMetadata::new("abc123", "main", BuildTimestamp::from_datetime(at));
        let names: Vec<_> = meta.fields().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, [FIELD_BUILD_NUMBER, FIELD_BRANCH, FIELD_TIMESTAMP]);
        assert_eq!(
            meta.build_flags(),
            vec![
                r#"-DFIRMWARE_BUILD_NUMBER=\"abc123\""#.to_string(),
                r#"-DGIT_BRANCH=\"main\""#.to_string(),
                r#"-DBUILD_TIMESTAMP_NUM=\"20240101_120000\""#.to_string(),
            ]
        );
    }

    #[test]
    fn metadata_serializes_flat_timestamp() {
        let at = NaiveDate::from_ymd_opt(2023, 6, 30)
            .unwrap()
            .and_hms_opt(23, 59, 1)
            .unwrap();
        let meta = BuildMetadata::new("dev", "unknown", BuildTimestamp::from_datetime(at));
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["revision"]["commit_hash"], "dev");
        assert_eq!(v["revision"]["branch"], "unknown");
        assert_eq!(v["timestamp"], "20230630_235901");
    }

    proptest! {
        #[test]
        fn every_failure_yields_sentinels(rev in failure(), branch in failure()) {
            let r = resolver(rev, branch);
            let meta = r.resolve();
            prop_assert_eq!(meta.revision.commit_hash, UNKNOWN_COMMIT);
            prop_assert_eq!(meta.revision.branch, UNKNOWN_BRANCH);
        }
    }
}
