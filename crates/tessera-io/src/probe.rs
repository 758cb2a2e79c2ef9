//! I/O capability probe.
//!
//! Before the log store commits to a write strategy it needs to know two
//! things about its data directory:
//!
//! 1. the buffer alignment Direct I/O requires there (0 if Direct I/O is
//!    unusable), and
//! 2. whether a Direct I/O write can be submitted through kernel AIO without
//!    ever blocking the submitting thread.
//!
//! Neither can be read reliably from the filesystem name or kernel version:
//! overlay and virtualized filesystems often accept `O_DIRECT` and then fail
//! or silently degrade. So the probe exercises the real write path on a real
//! file in the target directory.
//!
//! # Procedure
//!
//! ```text
//! mkstemp(<dir>/.probe-XXXXXX) -> fallocate(max_alignment) -> unlink
//!   │
//!   ├─ fcntl(O_DIRECT) rejected ──> tmpfs / ZFS? alignment 0 : error
//!   │
//!   └─ accepted ──> write(max_alignment), write(max/2), ... write(min)
//!                      first full write wins; EIO/EOPNOTSUPP try smaller
//!                        │
//!                        └─ alignment > 0 ──> io_submit(RWF_NOWAIT|RWF_DSYNC)
//!                                               full completion => async
//! ```
//!
//! The probe file is unlinked right after creation, so nothing is left behind
//! once the descriptor closes. A crash in between can leave a
//! `.probe-XXXXXX` file in the directory; scanners must ignore it.
//!
//! Results are not cached: probing again reflects the current state of the
//! filesystem.

use std::path::Path;

use crate::aligned::AlignedBuffer;
use crate::config::ProbeConfig;
use crate::fs::{self, FileHandle, OpenFlags};
use crate::{IoError, IoResult};

/// `TMPFS_MAGIC` from `<linux/magic.h>`.
pub const TMPFS_MAGIC: u64 = 0x0102_1994;

/// ZFS on Linux superblock magic.
pub const ZFS_MAGIC: u64 = 0x2fc1_2fc1;

/// Outcome of a capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// Required Direct I/O alignment in bytes, or 0 if Direct I/O is unusable.
    pub direct_alignment: usize,
    /// Whether Direct I/O writes can go through kernel AIO without blocking.
    /// Never true when `direct_alignment` is 0.
    pub async_capable: bool,
}

impl ProbeResult {
    /// The write strategy these capabilities allow.
    pub fn write_strategy(&self) -> WriteStrategy {
        match (self.direct_alignment, self.async_capable) {
            (0, _) => WriteStrategy::Buffered,
            (alignment, false) => WriteStrategy::Direct { alignment },
            (alignment, true) => WriteStrategy::DirectAsync { alignment },
        }
    }
}

/// How the log store should write its segment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Through the page cache, synchronously.
    Buffered,
    /// `O_DIRECT` writes of `alignment`-sized blocks from a blocking thread.
    Direct { alignment: usize },
    /// `O_DIRECT` writes submitted with kernel AIO using `RWF_NOWAIT`.
    DirectAsync { alignment: usize },
}

impl WriteStrategy {
    /// Buffer, length and offset alignment writes must respect, if any.
    pub fn alignment(&self) -> Option<usize> {
        match self {
            Self::Buffered => None,
            Self::Direct { alignment } | Self::DirectAsync { alignment } => Some(*alignment),
        }
    }

    /// Flags for opening (or creating) a segment file under this strategy.
    pub fn open_flags(&self) -> OpenFlags {
        OpenFlags {
            create: true,
            ..OpenFlags::read_write()
        }
        .with_direct(self.alignment().is_some())
    }
}

/// Probes `dir` with the default configuration.
///
/// This is what the log store calls once at startup.
pub fn probe_io_capabilities(dir: &Path) -> IoResult<ProbeResult> {
    Prober::default().probe(dir)
}

/// Runs capability probes with a given [`ProbeConfig`].
#[derive(Debug, Clone, Default)]
pub struct Prober {
    config: ProbeConfig,
}

impl Prober {
    /// Creates a prober after validating `config`.
    pub fn new(config: ProbeConfig) -> IoResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probes the filesystem holding `dir`.
    ///
    /// Errors name the step that failed. The probe file, descriptor and AIO
    /// context are released on every path.
    pub fn probe(&self, dir: &Path) -> IoResult<ProbeResult> {
        let file = self.create_probe_file(dir)?;

        let direct_alignment = self.probe_direct_io(&file)?;

        // Without Direct I/O, io_submit may block on the page cache.
        let async_capable = if direct_alignment > 0 && self.config.probe_async {
            probe_async_io(&file, direct_alignment)?
        } else {
            false
        };

        if let Err(err) = fs::close(file) {
            tracing::debug!(error = %err, "failed to close probe file");
        }

        let result = ProbeResult {
            direct_alignment,
            async_capable,
        };
        tracing::info!(
            dir = %dir.display(),
            direct_alignment,
            async_capable,
            "probed I/O capabilities"
        );
        Ok(result)
    }

    /// Creates, preallocates and unlinks the probe file.
    ///
    /// Panics if `dir` is longer than [`fs::DIR_MAX_LEN`], like [`fs::join`].
    fn create_probe_file(&self, dir: &Path) -> IoResult<FileHandle> {
        assert!(
            dir.as_os_str().len() <= fs::DIR_MAX_LEN,
            "directory name too long: {} bytes",
            dir.as_os_str().len()
        );

        let (file, path) = tempfile::Builder::new()
            .prefix(&self.config.file_prefix)
            .rand_bytes(6)
            .tempfile_in(dir)
            .map_err(|e| IoError::os("mkstemp", e))?
            .into_parts();

        let file = FileHandle::from_file(file, path.to_path_buf());
        // The largest candidate write must land on allocated blocks.
        fs::fallocate(&file, 0, self.config.max_alignment as u64)?;

        // The open descriptor keeps the storage alive.
        path.close().map_err(|e| IoError::os("unlink", e))?;

        tracing::debug!(path = %file.path().display(), "created probe file");
        Ok(file)
    }

    /// Finds the largest candidate alignment at which Direct I/O writes succeed.
    fn probe_direct_io(&self, file: &FileHandle) -> IoResult<usize> {
        match fs::set_direct_io(file) {
            Ok(()) => {}
            Err(err) if err.errno() == Some(libc::EINVAL) => {
                return direct_io_rejected(file);
            }
            Err(IoError::NotSupported { .. }) => {
                tracing::debug!("no Direct I/O flag on this platform");
                return Ok(0);
            }
            Err(err) => return Err(err),
        }

        first_direct_alignment(
            self.config.candidate_alignments(),
            self.config.max_alignment,
            |size| {
                let buf = AlignedBuffer::zeroed(size, size)?;
                // Failed writes leave the position at 0, so every attempt
                // targets the start of the preallocated range.
                fs::write(file, buf.as_slice())
            },
        )
    }
}

/// Tries `write` at each candidate size, largest first, and returns the first
/// size written in full, or 0 if none was.
fn first_direct_alignment(
    candidates: impl Iterator<Item = usize>,
    max_alignment: usize,
    mut write: impl FnMut(usize) -> IoResult<usize>,
) -> IoResult<usize> {
    for size in candidates {
        match write(size) {
            Ok(n) if n == size => {
                tracing::debug!(alignment = size, "direct write succeeded");
                return Ok(size);
            }
            Ok(n) => {
                return Err(IoError::ShortWrite {
                    op: "write",
                    expected: size,
                    actual: n,
                });
            }
            Err(err) => {
                if let Some(alignment) = classify_direct_write_error(size, max_alignment, err)? {
                    return Ok(alignment);
                }
            }
        }
    }

    Ok(0)
}

/// Decides what a failed direct write of `size` bytes means.
///
/// `Ok(None)` moves on to the next smaller candidate, `Ok(Some(0))` disables
/// Direct I/O, and an error aborts the probe.
fn classify_direct_write_error(
    size: usize,
    max_alignment: usize,
    err: IoError,
) -> IoResult<Option<usize>> {
    match err.errno() {
        Some(libc::EIO | libc::EOPNOTSUPP) => {
            tracing::debug!(alignment = size, error = %err, "direct write rejected");
            Ok(None)
        }
        // Some compatibility shims (shiftfs over ZFS, for one) accept
        // O_DIRECT in fcntl and only fail the write. Specific to that
        // case: EINVAL at any smaller size is still an error.
        Some(libc::EINVAL) if size == max_alignment => {
            tracing::warn!(
                alignment = size,
                "direct write failed with EINVAL after O_DIRECT was accepted, disabling Direct I/O"
            );
            Ok(Some(0))
        }
        _ => Err(err),
    }
}

/// `O_DIRECT` was refused; decide from the filesystem type whether that is
/// expected.
fn direct_io_rejected(file: &FileHandle) -> IoResult<usize> {
    rejected_fs_alignment(fs::filesystem_magic(file)?)
}

/// Alignment to report when a filesystem with `magic` refuses `O_DIRECT`.
fn rejected_fs_alignment(magic: u64) -> IoResult<usize> {
    match magic {
        TMPFS_MAGIC | ZFS_MAGIC => {
            tracing::debug!(
                magic = format_args!("{magic:#x}"),
                "Direct I/O not available on this filesystem"
            );
            Ok(0)
        }
        _ => Err(IoError::UnsupportedFileSystem { magic }),
    }
}

/// Checks whether a `RWF_NOWAIT` AIO write of `size` bytes completes.
#[cfg(target_os = "linux")]
fn probe_async_io(file: &FileHandle, size: usize) -> IoResult<bool> {
    use std::os::fd::AsRawFd;

    use crate::aio::{AioContext, IoEvent, IoRequest, RWF_DSYNC, RWF_NOWAIT};

    // Declared before the context so it is dropped after it: dropping the
    // context waits for anything still in flight.
    let buf = AlignedBuffer::zeroed(size, size)?;
    let ctx = AioContext::new(1)?;

    let mut req = IoRequest::pwrite(file.as_raw_fd(), buf.as_ptr(), size, 0)
        .with_rw_flags(RWF_NOWAIT | RWF_DSYNC);

    // SAFETY: `buf` outlives `ctx`, and the event is reaped before either is
    // dropped on the success path.
    let submitted = unsafe { ctx.submit(&mut [&mut req]) };
    if !nowait_submit_accepted(submitted)? {
        return Ok(false);
    }

    let mut events = [IoEvent::default()];
    ctx.get_events(1, &mut events, None)?;
    ctx.destroy()?;

    Ok(nowait_write_completed(events[0].result(), size))
}

/// Whether a `RWF_NOWAIT` submission went through. Kernels and filesystems
/// without support fail it with `EOPNOTSUPP`.
#[cfg(target_os = "linux")]
fn nowait_submit_accepted(submitted: IoResult<()>) -> IoResult<bool> {
    match submitted {
        Ok(()) => Ok(true),
        // Seen on ZFS 0.8.
        Err(err) if err.errno() == Some(libc::EOPNOTSUPP) => {
            tracing::debug!(error = %err, "non-blocking AIO not supported");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Only a full write counts; `-EAGAIN` means the write would have blocked.
#[cfg(target_os = "linux")]
fn nowait_write_completed(res: i64, size: usize) -> bool {
    if res == size as i64 {
        return true;
    }
    tracing::debug!(result = res, expected = size, "non-blocking AIO write did not complete");
    false
}

/// No `RWF_NOWAIT` here, so `io_submit` could always block.
#[cfg(not(target_os = "linux"))]
fn probe_async_io(_file: &FileHandle, _size: usize) -> IoResult<bool> {
    Ok(false)
}
