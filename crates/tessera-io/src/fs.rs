//! File operations used by the log store.
//!
//! Each function wraps a single syscall (or a short fixed sequence of them)
//! and reports failure as an [`IoError`] naming that syscall. Nothing here
//! retries, caches, or buffers; durability calls block until the kernel is
//! done.

use std::ffi::OsString;
use std::fs::{File, Metadata, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::{IoError, IoResult};

/// Size of a full path buffer, including the terminator.
pub const PATH_SIZE: usize = 1024;

/// Longest filename accepted by [`join`].
pub const FILENAME_MAX_LEN: usize = 128;

/// Longest directory accepted by [`join`]: room for the separator, a maximal
/// filename and the terminator.
pub const DIR_MAX_LEN: usize = PATH_SIZE - 1 - FILENAME_MAX_LEN - 1;

/// Permission bits for files created by this layer.
pub const DEFAULT_FILE_MODE: u32 = 0o600;

/// Flags for opening files.
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Create the file if it doesn't exist.
    pub create: bool,
    /// Fail if the file already exists (implies create).
    pub exclusive: bool,
    /// Truncate an existing file to zero length.
    pub truncate: bool,
    /// Open in append mode.
    pub append: bool,
    /// Bypass the page cache.
    pub direct: bool,
    /// Permission bits used when creating.
    pub mode: u32,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: false,
            write: false,
            create: false,
            exclusive: false,
            truncate: false,
            append: false,
            direct: false,
            mode: DEFAULT_FILE_MODE,
        }
    }
}

impl OpenFlags {
    /// Flags for reading an existing file.
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Flags for reading and writing an existing file.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    /// Flags for creating a file that must not exist yet.
    pub fn create_new() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            exclusive: true,
            ..Self::default()
        }
    }

    /// Flags for creating or appending to a file.
    pub fn append_create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            append: true,
            ..Self::default()
        }
    }

    /// Returns these flags with Direct I/O switched on or off.
    pub fn with_direct(self, direct: bool) -> Self {
        Self { direct, ..self }
    }
}

/// An open file and the path it was opened from.
///
/// Dropping the handle closes the descriptor; [`close`] does the same but
/// reports errors.
#[derive(Debug)]
pub struct FileHandle {
    file: File,
    path: PathBuf,
}

impl FileHandle {
    pub(crate) fn from_file(file: File, path: PathBuf) -> Self {
        Self { file, path }
    }

    /// Path this handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying file.
    pub fn file(&self) -> &File {
        &self.file
    }
}

impl AsRawFd for FileHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Opens `path` with the given flags.
pub fn open(path: &Path, flags: OpenFlags) -> IoResult<FileHandle> {
    let mut opts = OpenOptions::new();
    opts.read(flags.read)
        .write(flags.write)
        .append(flags.append)
        .truncate(flags.truncate)
        .mode(flags.mode);

    if flags.exclusive {
        opts.create_new(true);
    } else {
        opts.create(flags.create);
    }

    #[cfg(target_os = "linux")]
    if flags.direct {
        opts.custom_flags(libc::O_DIRECT);
    }

    let file = opts.open(path).map_err(|e| IoError::os("open", e))?;
    let handle = FileHandle::from_file(file, path.to_path_buf());

    // No open-time flag outside Linux; toggle it on the descriptor instead.
    #[cfg(not(target_os = "linux"))]
    if flags.direct {
        set_direct_io(&handle)?;
    }

    Ok(handle)
}

/// Opens `filename` inside `dir`.
///
/// A missing file can be told apart with [`IoError::is_not_found`].
pub fn open_in(dir: &Path, filename: &str, flags: OpenFlags) -> IoResult<FileHandle> {
    open(&join(dir, filename), flags)
}

/// Closes the descriptor, reporting any error from `close(2)`.
pub fn close(handle: FileHandle) -> IoResult<()> {
    use std::os::fd::IntoRawFd;

    let fd = handle.file.into_raw_fd();
    // SAFETY: fd was owned by the handle and is not used again.
    if unsafe { libc::close(fd) } == -1 {
        return Err(IoError::last_os_error("close"));
    }
    Ok(())
}

/// Writes at the current file position. Returns the number of bytes written.
pub fn write(handle: &FileHandle, buf: &[u8]) -> IoResult<usize> {
    (&handle.file)
        .write(buf)
        .map_err(|e| IoError::os("write", e))
}

/// Writes at `offset` without moving the file position.
pub fn write_at(handle: &FileHandle, buf: &[u8], offset: u64) -> IoResult<usize> {
    handle
        .file
        .write_at(buf, offset)
        .map_err(|e| IoError::os("pwrite", e))
}

/// Reads at `offset` without moving the file position.
pub fn read_at(handle: &FileHandle, buf: &mut [u8], offset: u64) -> IoResult<usize> {
    handle
        .file
        .read_at(buf, offset)
        .map_err(|e| IoError::os("pread", e))
}

/// Fills `buf` from the current file position.
///
/// Hitting end of file first yields [`IoError::ShortRead`].
pub fn read_fully(handle: &FileHandle, buf: &mut [u8]) -> IoResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match (&handle.file).read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(IoError::ShortRead {
                    expected: buf.len(),
                    actual: filled,
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(IoError::os("read", e)),
        }
    }
    Ok(())
}

/// Flushes data and metadata to stable storage.
pub fn fsync(handle: &FileHandle) -> IoResult<()> {
    handle.file.sync_all().map_err(|e| IoError::os("fsync", e))
}

/// Flushes data, and only the metadata needed to read it back.
pub fn fdatasync(handle: &FileHandle) -> IoResult<()> {
    handle
        .file
        .sync_data()
        .map_err(|e| IoError::os("fdatasync", e))
}

/// Truncates or extends the file to `len` bytes.
pub fn truncate(handle: &FileHandle, len: u64) -> IoResult<()> {
    handle
        .file
        .set_len(len)
        .map_err(|e| IoError::os("ftruncate", e))
}

/// Reserves storage so the file spans at least `offset + len` bytes.
///
/// Filesystems without native preallocation get one byte written per block
/// across the range, which forces the blocks to be allocated without
/// rewriting the whole region. If that fails too the result is
/// [`IoError::NotSupported`], whatever the underlying errno was.
///
/// The handle must not be in append mode or opened for Direct I/O when the
/// fallback kicks in.
pub fn fallocate(handle: &FileHandle, offset: u64, len: u64) -> IoResult<()> {
    preallocate_or_fall_back(native_fallocate(handle, offset, len), || {
        tracing::warn!(
            path = %handle.path().display(),
            offset,
            len,
            "native fallocate not supported, extending with block writes"
        );
        fallocate_by_writes(handle, offset, len)
    })
}

/// Runs `fallback` only when native preallocation was unsupported, and
/// reports any fallback failure as [`IoError::NotSupported`].
fn preallocate_or_fall_back(
    native: IoResult<()>,
    fallback: impl FnOnce() -> IoResult<()>,
) -> IoResult<()> {
    match native {
        Ok(()) => return Ok(()),
        Err(err) if err.is_not_supported() => {}
        Err(err) => return Err(err),
    }

    fallback().map_err(|err| {
        tracing::debug!(error = %err, "fallocate fallback failed");
        IoError::NotSupported { op: "fallocate" }
    })
}

#[cfg(target_os = "linux")]
fn native_fallocate(handle: &FileHandle, offset: u64, len: u64) -> IoResult<()> {
    let offset = to_off_t("fallocate", offset)?;
    let len = to_off_t("fallocate", len)?;
    // SAFETY: plain syscall on an owned descriptor.
    if unsafe { libc::fallocate(handle.as_raw_fd(), 0, offset, len) } == -1 {
        return Err(IoError::last_os_error("fallocate"));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn native_fallocate(_handle: &FileHandle, _offset: u64, _len: u64) -> IoResult<()> {
    Err(IoError::NotSupported { op: "fallocate" })
}

#[cfg(target_os = "linux")]
fn to_off_t(op: &'static str, value: u64) -> IoResult<libc::off_t> {
    libc::off_t::try_from(value).map_err(|_| IoError::from_errno(op, libc::EFBIG))
}

/// Extends the file by writing a zero byte into every block of the range.
///
/// Blocks that already hold a non-zero byte at the probed position are left
/// alone. The final byte of the range is always covered, so the file size
/// reaches `offset + len`.
pub(crate) fn fallocate_by_writes(handle: &FileHandle, offset: u64, len: u64) -> IoResult<()> {
    if len == 0 {
        return Err(IoError::from_errno("fallocate", libc::EINVAL));
    }
    let end = offset
        .checked_add(len)
        .ok_or_else(|| IoError::from_errno("fallocate", libc::EFBIG))?;

    let meta = fstat(handle)?;
    let increment = meta.blksize().max(1);
    let size = meta.len();

    // Start so that the last position lands exactly on `end - 1`.
    let mut pos = offset + (len - 1) % increment;
    while pos < end {
        if pos < size {
            let mut byte = [0u8; 1];
            if read_at(handle, &mut byte, pos)? == 1 && byte[0] != 0 {
                pos += increment;
                continue;
            }
        }
        let n = write_at(handle, &[0], pos)?;
        if n != 1 {
            return Err(IoError::ShortWrite {
                op: "pwrite",
                expected: 1,
                actual: n,
            });
        }
        pos += increment;
    }
    Ok(())
}

/// Metadata for `path`.
pub fn stat(path: &Path) -> IoResult<Metadata> {
    std::fs::metadata(path).map_err(|e| IoError::os("stat", e))
}

/// Metadata for an open file.
pub fn fstat(handle: &FileHandle) -> IoResult<Metadata> {
    handle.file.metadata().map_err(|e| IoError::os("fstat", e))
}

/// Removes a directory entry.
pub fn unlink(path: &Path) -> IoResult<()> {
    std::fs::remove_file(path).map_err(|e| IoError::os("unlink", e))
}

/// Renames `from` to `to`, replacing `to` if it exists.
///
/// The destination directory is fsynced before returning, so once this
/// succeeds the rename survives a crash and is ordered after any writes
/// already synced to `from`.
pub fn rename(from: &Path, to: &Path) -> IoResult<()> {
    std::fs::rename(from, to).map_err(|e| IoError::os("rename", e))?;

    let parent = match to.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| IoError::os("fsync", e))
}

/// Joins a directory and a filename with a `/`.
///
/// # Panics
///
/// Panics if `dir` is longer than [`DIR_MAX_LEN`] or `filename` longer than
/// [`FILENAME_MAX_LEN`]. Both lengths are under the caller's control, so an
/// oversized one is a bug rather than a runtime condition.
pub fn join(dir: &Path, filename: &str) -> PathBuf {
    assert!(
        dir.as_os_str().len() <= DIR_MAX_LEN,
        "directory name too long: {} bytes",
        dir.as_os_str().len()
    );
    assert!(
        filename.len() <= FILENAME_MAX_LEN,
        "filename too long: {} bytes",
        filename.len()
    );

    let mut path = OsString::with_capacity(dir.as_os_str().len() + 1 + filename.len());
    path.push(dir.as_os_str());
    path.push("/");
    path.push(filename);
    PathBuf::from(path)
}

/// Switches an open descriptor to Direct I/O.
///
/// No read-back is done; a filesystem that accepts the flag but cannot honor
/// it shows up only when an unaligned write fails.
#[cfg(target_os = "linux")]
pub fn set_direct_io(handle: &FileHandle) -> IoResult<()> {
    let fd = handle.as_raw_fd();
    // SAFETY: F_GETFL takes no argument.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(IoError::last_os_error("fcntl"));
    }
    // SAFETY: F_SETFL takes an int flag set.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_DIRECT) } == -1 {
        return Err(IoError::last_os_error("fcntl"));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
pub fn set_direct_io(handle: &FileHandle) -> IoResult<()> {
    // SAFETY: F_NOCACHE takes an int toggle.
    if unsafe { libc::fcntl(handle.as_raw_fd(), libc::F_NOCACHE, 1) } == -1 {
        return Err(IoError::last_os_error("fcntl"));
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn set_direct_io(_handle: &FileHandle) -> IoResult<()> {
    Err(IoError::NotSupported { op: "fcntl" })
}

/// Filesystem type magic of the filesystem holding `handle`.
#[cfg(target_os = "linux")]
pub fn filesystem_magic(handle: &FileHandle) -> IoResult<u64> {
    let mut info = std::mem::MaybeUninit::<libc::statfs>::uninit();
    // SAFETY: fstatfs fills the struct on success.
    if unsafe { libc::fstatfs(handle.as_raw_fd(), info.as_mut_ptr()) } == -1 {
        return Err(IoError::last_os_error("fstatfs"));
    }
    // SAFETY: initialized by the successful call above.
    let info = unsafe { info.assume_init() };
    Ok(info.f_type as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn filesystem_magic(_handle: &FileHandle) -> IoResult<u64> {
    Err(IoError::NotSupported { op: "fstatfs" })
}

/// Creates an eventfd, e.g. for AIO completion notification.
#[cfg(target_os = "linux")]
pub fn eventfd(initval: u32, flags: i32) -> IoResult<std::os::fd::OwnedFd> {
    use std::os::fd::FromRawFd;

    // SAFETY: plain syscall.
    let fd = unsafe { libc::eventfd(initval, flags) };
    if fd == -1 {
        return Err(IoError::last_os_error("eventfd"));
    }
    // SAFETY: fd is freshly created and owned by nobody else.
    Ok(unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(path: &Path) -> FileHandle {
        let flags = OpenFlags {
            create: true,
            truncate: true,
            ..OpenFlags::read_write()
        };
        open(path, flags).unwrap()
    }

    #[test]
    fn native_preallocation_skips_fallback() {
        let result = preallocate_or_fall_back(Ok(()), || panic!("fallback must not run"));
        assert!(result.is_ok());
    }

    #[test]
    fn native_failure_other_than_unsupported_is_returned() {
        let err = preallocate_or_fall_back(Err(IoError::from_errno("fallocate", libc::ENOSPC)), || {
            panic!("fallback must not run")
        })
        .unwrap_err();
        assert_eq!(err.op(), Some("fallocate"));
        assert_eq!(err.errno(), Some(libc::ENOSPC));
    }

    #[test]
    fn unsupported_native_preallocation_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let handle = create(&dir.path().join("fallback.dat"));
        let native = Err(IoError::from_errno("fallocate", libc::EOPNOTSUPP));

        preallocate_or_fall_back(native, || fallocate_by_writes(&handle, 0, 8192)).unwrap();
        assert_eq!(fstat(&handle).unwrap().len(), 8192);
    }

    #[test]
    fn failed_fallback_reports_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readonly.dat");
        std::fs::write(&path, b"").unwrap();
        let handle = open(&path, OpenFlags::read_only()).unwrap();
        let native = Err(IoError::NotSupported { op: "fallocate" });

        let err =
            preallocate_or_fall_back(native, || fallocate_by_writes(&handle, 0, 4096)).unwrap_err();
        assert!(matches!(err, IoError::NotSupported { op: "fallocate" }));
    }

    #[test]
    fn write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.dat");

        let handle = open(&path, OpenFlags::append_create()).unwrap();
        assert_eq!(write(&handle, b"hello world").unwrap(), 11);
        fsync(&handle).unwrap();
        close(handle).unwrap();

        let handle = open(&path, OpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 11];
        read_fully(&handle, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn read_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("read_at.dat");
        let handle = create(&path);
        write(&handle, b"0123456789").unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(read_at(&handle, &mut buf, 3).unwrap(), 5);
        assert_eq!(&buf, b"34567");
    }

    #[test]
    fn read_fully_reports_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.dat");
        let handle = create(&path);
        write_at(&handle, b"abc", 0).unwrap();

        let mut buf = [0u8; 8];
        let err = read_fully(&handle, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            IoError::ShortRead {
                expected: 8,
                actual: 3
            }
        ));
    }

    #[test]
    fn append_mode_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append.dat");

        let handle = open(&path, OpenFlags::append_create()).unwrap();
        write(&handle, b"hello").unwrap();
        close(handle).unwrap();

        let handle = open(&path, OpenFlags::append_create()).unwrap();
        write(&handle, b" world").unwrap();
        assert_eq!(fstat(&handle).unwrap().len(), 11);
    }

    #[test]
    fn create_new_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exclusive.dat");
        drop(open(&path, OpenFlags::create_new()).unwrap());

        let err = open(&path, OpenFlags::create_new()).unwrap_err();
        assert_eq!(err.errno(), Some(libc::EEXIST));
        assert_eq!(err.op(), Some("open"));
    }

    #[test]
    fn created_files_use_default_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mode.dat");
        drop(open(&path, OpenFlags::create_new()).unwrap());
        assert_eq!(stat(&path).unwrap().mode() & 0o777, DEFAULT_FILE_MODE);
    }

    #[test]
    fn open_in_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_in(dir.path(), "missing", OpenFlags::read_only()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn truncate_and_fdatasync() {
        let dir = tempfile::tempdir().unwrap();
        let handle = create(&dir.path().join("trunc.dat"));
        write(&handle, &[1u8; 100]).unwrap();
        truncate(&handle, 10).unwrap();
        fdatasync(&handle).unwrap();
        assert_eq!(fstat(&handle).unwrap().len(), 10);
    }

    #[test]
    fn fallocate_extends_file() {
        let dir = tempfile::tempdir().unwrap();
        let handle = create(&dir.path().join("prealloc.dat"));
        fallocate(&handle, 0, 4096).unwrap();
        assert!(fstat(&handle).unwrap().len() >= 4096);
    }

    #[test]
    fn fallocate_by_writes_reaches_requested_size() {
        let dir = tempfile::tempdir().unwrap();
        let handle = create(&dir.path().join("fallback.dat"));

        for len in [1u64, 511, 4096, 10_000, 65_537] {
            fallocate_by_writes(&handle, 0, len).unwrap();
            assert!(fstat(&handle).unwrap().len() >= len, "len {len}");
        }
        fallocate_by_writes(&handle, 100_000, 3).unwrap();
        assert_eq!(fstat(&handle).unwrap().len(), 100_003);
    }

    #[test]
    fn fallocate_by_writes_keeps_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let handle = create(&dir.path().join("keep.dat"));
        let data = vec![0xabu8; 8192];
        write_at(&handle, &data, 0).unwrap();

        fallocate_by_writes(&handle, 0, 16_384).unwrap();

        let mut buf = vec![0u8; 8192];
        assert_eq!(read_at(&handle, &mut buf, 0).unwrap(), 8192);
        assert_eq!(buf, data);
        assert!(fstat(&handle).unwrap().len() >= 16_384);
    }

    #[test]
    fn fallocate_by_writes_rejects_empty_range() {
        let dir = tempfile::tempdir().unwrap();
        let handle = create(&dir.path().join("empty.dat"));
        let err = fallocate_by_writes(&handle, 0, 0).unwrap_err();
        assert_eq!(err.errno(), Some(libc::EINVAL));
    }

    #[test]
    fn rename_overwrites_destination() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from.dat");
        let to = dir.path().join("to.dat");
        std::fs::write(&from, b"new").unwrap();
        std::fs::write(&to, b"old").unwrap();

        rename(&from, &to).unwrap();

        assert_eq!(std::fs::read(&to).unwrap(), b"new");
        assert!(stat(&from).unwrap_err().is_not_found());
    }

    #[test]
    fn unlink_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.dat");
        std::fs::write(&path, b"x").unwrap();

        unlink(&path).unwrap();
        assert!(unlink(&path).unwrap_err().is_not_found());
    }

    #[test]
    fn join_inserts_separator() {
        assert_eq!(
            join(Path::new("/var/lib/raft"), "metadata1"),
            PathBuf::from("/var/lib/raft/metadata1")
        );
    }

    #[test]
    #[should_panic(expected = "filename too long")]
    fn join_rejects_long_filename() {
        join(Path::new("/tmp"), &"x".repeat(FILENAME_MAX_LEN + 1));
    }

    #[test]
    #[should_panic(expected = "directory name too long")]
    fn join_rejects_long_directory() {
        let dir = format!("/{}", "d".repeat(DIR_MAX_LEN));
        join(Path::new(&dir), "f");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn filesystem_magic_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let handle = create(&dir.path().join("fs.dat"));
        assert_ne!(filesystem_magic(&handle).unwrap(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn eventfd_is_readable_after_write() {
        let fd = eventfd(3, libc::EFD_NONBLOCK).unwrap();
        let mut file = File::from(fd);
        let mut counter = [0u8; 8];
        file.read_exact(&mut counter).unwrap();
        assert_eq!(u64::from_ne_bytes(counter), 3);
    }
}
