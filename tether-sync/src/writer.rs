//! Output sinks for rendered templates.
//!
//! ## `FileSink::write` protocol
//!
//! 1. SHA-256 the rendered contents.
//! 2. Compare with the destination's known digest, skip if identical.
//! 3. Create parent directories, write `<dest>.tether.tmp`.
//! 4. Apply permissions: the configured mode, else the existing file's mode.
//! 5. Copy the existing destination to `<dest>.bak` when backups are on.
//! 6. Rename the temp file over the destination (atomic on POSIX).
//! 7. Record the new digest.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::digest::{digest, DigestCache};
use crate::error::{io_err, SyncError};

/// Outcome of an individual write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Destination was written (content changed or did not previously exist).
    Written { path: PathBuf },
    /// Skipped: rendered content matches what the destination holds.
    Unchanged { path: PathBuf },
    /// Dry mode: the destination *would* have been written.
    WouldWrite { path: PathBuf },
}

impl WriteResult {
    pub fn path(&self) -> &Path {
        match self {
            WriteResult::Written { path }
            | WriteResult::Unchanged { path }
            | WriteResult::WouldWrite { path } => path,
        }
    }

    /// True when the destination changed (or would have, in dry mode).
    pub fn changed(&self) -> bool {
        !matches!(self, WriteResult::Unchanged { .. })
    }
}

/// One rendered template headed for its destination.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
    pub destination: &'a Path,
    pub contents: &'a str,
    /// Unix permission bits; ignored elsewhere.
    pub perms: Option<u32>,
    pub backup: bool,
}

/// Where rendered contents go.
pub trait OutputSink: Send {
    fn write(&mut self, request: &WriteRequest<'_>) -> Result<WriteResult, SyncError>;
}

fn tmp_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tether.tmp", path.display()))
}

fn backup_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.bak", path.display()))
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

/// Writes destinations on the local filesystem.
#[derive(Debug, Default)]
pub struct FileSink {
    digests: DigestCache,
}

impl FileSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputSink for FileSink {
    fn write(&mut self, request: &WriteRequest<'_>) -> Result<WriteResult, SyncError> {
        let path = request.destination;
        let sum = digest(request.contents.as_bytes());

        if self.digests.current(path, true)? == Some(sum.as_str()) {
            debug!(path = %path.display(), "unchanged");
            return Ok(WriteResult::Unchanged {
                path: path.to_path_buf(),
            });
        }

        let tmp = tmp_path(path);
        if let Err(e) = write_replacing(path, &tmp, request) {
            let _ = std::fs::remove_file(&tmp);
            // The destination may or may not have been replaced; rehash next time.
            self.digests.forget(path);
            return Err(e);
        }

        self.digests.record(path, sum);
        info!(path = %path.display(), "wrote");
        Ok(WriteResult::Written {
            path: path.to_path_buf(),
        })
    }
}

fn write_replacing(path: &Path, tmp: &Path, request: &WriteRequest<'_>) -> Result<(), SyncError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    std::fs::write(tmp, request.contents).map_err(|e| io_err(tmp, e))?;

    let existing = match std::fs::metadata(path) {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(io_err(path, e)),
    };
    apply_perms(tmp, request.perms, existing.as_ref())?;

    if request.backup && existing.is_some() {
        let bak = backup_path(path);
        std::fs::copy(path, &bak).map_err(|e| io_err(&bak, e))?;
        debug!(path = %bak.display(), "backed up previous contents");
    }

    std::fs::rename(tmp, path).map_err(|e| io_err(path, e))
}

#[cfg(unix)]
fn apply_perms(
    tmp: &Path,
    perms: Option<u32>,
    existing: Option<&std::fs::Metadata>,
) -> Result<(), SyncError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = perms.or_else(|| existing.map(|meta| meta.permissions().mode() & 0o7777));
    if let Some(mode) = mode {
        std::fs::set_permissions(tmp, std::fs::Permissions::from_mode(mode))
            .map_err(|e| io_err(tmp, e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_perms(
    _tmp: &Path,
    _perms: Option<u32>,
    _existing: Option<&std::fs::Metadata>,
) -> Result<(), SyncError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// DrySink
// ---------------------------------------------------------------------------

/// Echoes `> <destination>` and the contents instead of writing.
///
/// Gating compares against what was last echoed, not against disk, so the
/// first render of every template is always shown.
pub struct DrySink<W> {
    out: W,
    digests: DigestCache,
}

impl DrySink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> DrySink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            digests: DigestCache::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> OutputSink for DrySink<W> {
    fn write(&mut self, request: &WriteRequest<'_>) -> Result<WriteResult, SyncError> {
        let path = request.destination;
        let sum = digest(request.contents.as_bytes());

        if self.digests.current(path, false)? == Some(sum.as_str()) {
            debug!(path = %path.display(), "[dry] unchanged");
            return Ok(WriteResult::Unchanged {
                path: path.to_path_buf(),
            });
        }

        writeln!(self.out, "> {}", path.display()).map_err(SyncError::Echo)?;
        self.out
            .write_all(request.contents.as_bytes())
            .map_err(SyncError::Echo)?;
        if !request.contents.ends_with('\n') {
            writeln!(self.out).map_err(SyncError::Echo)?;
        }
        self.out.flush().map_err(SyncError::Echo)?;

        self.digests.record(path, sum);
        info!(path = %path.display(), "[dry] would write");
        Ok(WriteResult::WouldWrite {
            path: path.to_path_buf(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
