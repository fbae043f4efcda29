#![deny(warnings)]

//! Post-build artifact handling.
//!
//! Keeps a copy of the firmware image, plus its ELF for exception decoding,
//! in a local directory and offers the image to an upload endpoint. The
//! upload is best effort: an unreachable endpoint is reported, not raised.

use reqwest::blocking::{multipart, Client};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_DEBUG_DIR: &str = "../UniMixerServer/debug_files";
pub const DEFAULT_UPLOAD_URL: &str = "http://rndev.local:3000/api/upload";
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(5);

const UPLOAD_FIELD: &str = "firmware";
const DEBUG_SYMBOLS_EXT: &str = "elf";

/// Names the exception decoder on the receiving side looks for, whatever the
/// build called the artifacts.
pub const IMAGE_COPY_NAME: &str = "firmware.bin";
pub const SYMBOLS_COPY_NAME: &str = "firmware.elf";

/// Where artifacts go after a build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishConfig {
    /// Local directory receiving the image and its debug symbols.
    pub debug_dir: PathBuf,
    /// Multipart upload endpoint; `None` disables uploading.
    pub upload_url: Option<String>,
    pub upload_timeout: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            debug_dir: PathBuf::from(DEFAULT_DEBUG_DIR),
            upload_url: Some(DEFAULT_UPLOAD_URL.to_string()),
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to create {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to copy {} to {}: {source}", .from.display(), .to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Disabled,
    /// The endpoint answered; any status counts.
    Uploaded { status: u16, body: String },
    Unreachable { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReport {
    /// No artifact existed at the given path; nothing was done.
    pub skipped: bool,
    /// Destination paths written, image first.
    pub copied: Vec<PathBuf>,
    pub upload: UploadOutcome,
}

impl PublishReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            copied: Vec::new(),
            upload: UploadOutcome::Disabled,
        }
    }
}

/// The ELF that sits next to a `.bin` image.
pub fn debug_symbols_path(artifact: &Path) -> PathBuf {
    artifact.with_extension(DEBUG_SYMBOLS_EXT)
}

/// Copies `artifact` and its debug symbols into `cfg.debug_dir` as
/// [`IMAGE_COPY_NAME`] and [`SYMBOLS_COPY_NAME`], then tries to upload the
/// artifact.
pub fn publish(artifact: &Path, cfg: &PublishConfig) -> Result<PublishReport, PublishError> {
    if !artifact.is_file() {
        info!(path = %artifact.display(), "no artifact found, skipping publish");
        return Ok(PublishReport::skipped());
    }

    fs::create_dir_all(&cfg.debug_dir).map_err(|source| PublishError::CreateDir {
        path: cfg.debug_dir.clone(),
        source,
    })?;

    let mut copied = vec![copy_to(artifact, cfg.debug_dir.join(IMAGE_COPY_NAME))?];
    let elf = debug_symbols_path(artifact);
    if elf != artifact && elf.is_file() {
        copied.push(copy_to(&elf, cfg.debug_dir.join(SYMBOLS_COPY_NAME))?);
    } else {
        info!(path = %elf.display(), "no debug symbols next to artifact, copying image only");
    }

    let upload = match &cfg.upload_url {
        Some(url) => upload(artifact, url, cfg.upload_timeout),
        None => UploadOutcome::Disabled,
    };

    Ok(PublishReport {
        skipped: false,
        copied,
        upload,
    })
}

fn copy_to(from: &Path, to: PathBuf) -> Result<PathBuf, PublishError> {
    fs::copy(from, &to).map_err(|source| PublishError::Copy {
        from: from.to_path_buf(),
        to: to.clone(),
        source,
    })?;
    info!(from = %from.display(), to = %to.display(), "copied artifact");
    Ok(to)
}

fn upload(artifact: &Path, url: &str, timeout: Duration) -> UploadOutcome {
    let unreachable = |reason: String| {
        warn!(url, %reason, "upload skipped");
        UploadOutcome::Unreachable { reason }
    };

    let client = match Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => return unreachable(err.to_string()),
    };
    let form = match multipart::Form::new().file(UPLOAD_FIELD, artifact) {
        Ok(form) => form,
        Err(err) => return unreachable(err.to_string()),
    };

    match client.post(url).multipart(form).send() {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let body = resp.text().unwrap_or_default();
            info!(url, status, %body, "upload finished");
            UploadOutcome::Uploaded { status, body }
        }
        Err(err) => unreachable(err.to_string()),
    }
}
