#![deny(warnings)]

//! Marker-delimited injection of build info into a C header.
//!
//! The generated block sits immediately before the last `#endif` of the
//! target header, between two fixed marker comments. Each run removes the
//! previous block (if a complete one is found) and inserts a fresh one, so
//! repeated runs with the same metadata leave the file byte-identical.
//!
//! Known limitation: only the first begin marker and the first end marker
//! after it are treated as the previous block. Further stale blocks and
//! unpaired markers are left in place, and a stray begin marker above the
//! block swallows every line between it and the block on the next run. A
//! warning is logged whenever more than one begin marker is present.

use buildinfo_core::BuildMetadata;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const BEGIN_MARKER: &str = "// >>> AUTO-GENERATED BUILD INFO BEGIN";
pub const END_MARKER: &str = "// <<< AUTO-GENERATED BUILD INFO END";
/// The block is inserted before the last line equal to this.
pub const ANCHOR: &str = "#endif";

/// Errors that abort injection. The target is never modified when one occurs
/// before the write.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no `#endif` line in {}; cannot place build info", .path.display())]
    MissingAnchor { path: PathBuf },
}

/// The text contains no [`ANCHOR`] line.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no `#endif` line found")]
pub struct MissingAnchor;

/// Line terminator used for inserted lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    /// Follows the first line of `text`; LF when there is none.
    pub fn detect(text: &str) -> Self {
        match text.find('\n') {
            Some(i) if text[..i].ends_with('\r') => LineEnding::CrLf,
            _ => LineEnding::Lf,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

/// Begin marker, one `#define` per metadata field, end marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedBlock {
    lines: Vec<String>,
}

impl GeneratedBlock {
    pub fn new(meta: &BuildMetadata) -> Self {
        let fields = meta.fields();
        let mut lines = Vec::with_capacity(fields.len() + 2);
        lines.push(BEGIN_MARKER.to_string());
        for (name, value) in fields {
            lines.push(format!("#define {name} \"{}\"", escape_c_string(value)));
        }
        lines.push(END_MARKER.to_string());
        Self { lines }
    }

    /// Lines without terminators.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Every line terminated with `eol`.
    pub fn render(&self, eol: LineEnding) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push_str(eol.as_str());
        }
        out
    }
}

fn escape_c_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn is_line(line: &str, literal: &str) -> bool {
    line.trim() == literal
}

/// Inclusive line range of the previous block: the first begin marker and the
/// first end marker after it. `None` unless both are present.
pub fn locate_block<S: AsRef<str>>(lines: &[S]) -> Option<(usize, usize)> {
    let begin = lines
        .iter()
        .position(|l| is_line(l.as_ref(), BEGIN_MARKER))?;
    let end = lines[begin + 1..]
        .iter()
        .position(|l| is_line(l.as_ref(), END_MARKER))?;
    Some((begin, begin + 1 + end))
}

/// Index of the last [`ANCHOR`] line.
pub fn find_anchor<S: AsRef<str>>(lines: &[S]) -> Option<usize> {
    lines.iter().rposition(|l| is_line(l.as_ref(), ANCHOR))
}

/// Result of rewriting a header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Injection {
    /// Full new file content.
    pub text: String,
    /// A previous block was found and removed.
    pub replaced: bool,
    /// `text` differs from the input.
    pub changed: bool,
}

/// Removes the previous block from `text` and inserts `block` before the last
/// anchor line. Existing line terminators are kept as they are.
pub fn inject_text(text: &str, block: &GeneratedBlock) -> Result<Injection, MissingAnchor> {
    let mut lines: Vec<&str> = text.split_inclusive('\n').collect();

    let begin_markers = lines.iter().filter(|l| is_line(l, BEGIN_MARKER)).count();
    if begin_markers > 1 {
        warn!(
            begin_markers,
            "multiple build info begin markers; lines between the first one and the \
             first end marker after it will be removed"
        );
    }

    let replaced = match locate_block(&lines) {
        Some((begin, end)) => {
            lines.drain(begin..=end);
            true
        }
        None => false,
    };

    let anchor = find_anchor(&lines).ok_or(MissingAnchor)?;
    let rendered = block.render(LineEnding::detect(text));

    let mut out = String::with_capacity(text.len() + rendered.len());
    lines[..anchor].iter().for_each(|l| out.push_str(l));
    out.push_str(&rendered);
    lines[anchor..].iter().for_each(|l| out.push_str(l));

    let changed = out != text;
    Ok(Injection {
        text: out,
        replaced,
        changed,
    })
}

/// Reads `path`, injects the block for `meta` and writes the whole file back.
///
/// The new content goes to a temporary file next to the target which then
/// replaces it, so the header is never observed half-written. A symlinked
/// target is resolved first so the file it points to is the one rewritten.
/// A read-only target is a write error.
pub fn inject(path: impl AsRef<Path>, meta: &BuildMetadata) -> Result<Injection, InjectError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| InjectError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let block = GeneratedBlock::new(meta);
    let injection =
        inject_text(&text, &block).map_err(|MissingAnchor| InjectError::MissingAnchor {
            path: path.to_path_buf(),
        })?;

    write_atomic(path, injection.text.as_bytes()).map_err(|source| InjectError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    if injection.changed {
        info!(
            path = %path.display(),
            commit = %meta.revision.commit_hash,
            branch = %meta.revision.branch,
            timestamp = %meta.timestamp,
            replaced = injection.replaced,
            "build info injected"
        );
    } else {
        debug!(path = %path.display(), "build info already current");
    }
    Ok(injection)
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let target = fs::canonicalize(path)?;
    let permissions = fs::metadata(&target)?.permissions();
    if permissions.readonly() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "target is read-only",
        ));
    }

    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), permissions)?;
    tmp.persist(&target).map_err(|e| e.error)?;
    Ok(())
}
