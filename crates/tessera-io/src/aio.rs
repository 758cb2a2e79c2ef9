//! Linux kernel AIO.
//!
//! Thin wrappers around `io_setup`, `io_destroy`, `io_submit` and
//! `io_getevents`. The request and event records mirror
//! `<linux/aio_abi.h>` byte for byte.
//!
//! The kernel copies each [`IoRequest`] during submission, but it reads from
//! (or writes to) the request's buffer until the matching [`IoEvent`] has been
//! reaped. There is no way to cancel a submitted request here: whatever is
//! submitted must be reaped.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::{IoError, IoResult};

/// `IOCB_CMD_PREAD`.
pub const IOCB_CMD_PREAD: u16 = 0;
/// `IOCB_CMD_PWRITE`.
pub const IOCB_CMD_PWRITE: u16 = 1;
/// `IOCB_FLAG_RESFD`: signal `aio_resfd` on completion.
pub const IOCB_FLAG_RESFD: u32 = 1 << 0;

/// Per-request `O_DSYNC` semantics.
pub const RWF_DSYNC: i32 = 0x0000_0002;
/// Fail with `EAGAIN` instead of blocking.
pub const RWF_NOWAIT: i32 = 0x0000_0008;

type RawContext = libc::c_ulong;

/// A kernel `struct iocb`.
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IoRequest {
    aio_data: u64,
    #[cfg(target_endian = "little")]
    aio_key: u32,
    aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    aio_key: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

impl IoRequest {
    /// A positional write of `len` bytes from `buf` to `fd` at `offset`.
    pub fn pwrite(fd: RawFd, buf: *const u8, len: usize, offset: u64) -> Self {
        Self::new(IOCB_CMD_PWRITE, fd, buf as u64, len, offset)
    }

    /// A positional read of `len` bytes from `fd` at `offset` into `buf`.
    pub fn pread(fd: RawFd, buf: *mut u8, len: usize, offset: u64) -> Self {
        Self::new(IOCB_CMD_PREAD, fd, buf as u64, len, offset)
    }

    fn new(opcode: u16, fd: RawFd, buf: u64, len: usize, offset: u64) -> Self {
        Self {
            aio_lio_opcode: opcode,
            aio_fildes: fd as u32,
            aio_buf: buf,
            aio_nbytes: len as u64,
            aio_offset: offset as i64,
            ..Self::default()
        }
    }

    /// Sets `RWF_*` flags for this request.
    pub fn with_rw_flags(mut self, flags: i32) -> Self {
        self.aio_rw_flags = flags;
        self
    }

    /// Sets the value echoed back in [`IoEvent::data`].
    pub fn with_data(mut self, data: u64) -> Self {
        self.aio_data = data;
        self
    }

    /// Bumps `eventfd` when this request completes.
    pub fn with_eventfd(mut self, eventfd: RawFd) -> Self {
        self.aio_flags |= IOCB_FLAG_RESFD;
        self.aio_resfd = eventfd as u32;
        self
    }
}

/// A kernel `struct io_event`.
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

impl IoEvent {
    /// The `data` value of the completed request.
    pub fn data(&self) -> u64 {
        self.data
    }

    /// Bytes transferred, or a negated errno.
    pub fn result(&self) -> i64 {
        self.res
    }

    /// The completion as a byte count or an OS error raised by `op`.
    pub fn into_result(self, op: &'static str) -> IoResult<usize> {
        if self.res < 0 {
            return Err(IoError::from_errno(op, (-self.res) as i32));
        }
        Ok(self.res as usize)
    }
}

/// A kernel AIO context.
///
/// Call [`AioContext::destroy`] to release it and observe errors; dropping it
/// also releases it and only logs a failure.
#[derive(Debug)]
pub struct AioContext {
    ctx: RawContext,
}

impl AioContext {
    /// Creates a context able to hold `max_events` outstanding requests.
    pub fn new(max_events: u32) -> IoResult<Self> {
        let mut ctx: RawContext = 0;
        // SAFETY: ctx must be zero on entry and is written by the kernel.
        let rv = unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                max_events as libc::c_long,
                &raw mut ctx,
            )
        };
        if rv == -1 {
            return Err(IoError::last_os_error("io_setup"));
        }
        Ok(Self { ctx })
    }

    /// Destroys the context, waiting for any in-flight requests.
    pub fn destroy(self) -> IoResult<()> {
        let ctx = self.ctx;
        std::mem::forget(self);
        io_destroy(ctx)
    }

    /// Submits all of `requests`.
    ///
    /// Either every request is queued or an error is returned and none is.
    ///
    /// # Safety
    ///
    /// Every buffer referenced by `requests` must stay valid, and must not be
    /// touched by anything else, until its completion has been reaped with
    /// [`AioContext::get_events`].
    ///
    /// # Panics
    ///
    /// Panics if the kernel accepts only part of the batch.
    pub unsafe fn submit(&self, requests: &mut [&mut IoRequest]) -> IoResult<()> {
        let nr = requests.len();
        // `&mut IoRequest` has the layout of `struct iocb *`.
        let iocbpp = requests.as_mut_ptr().cast::<*mut IoRequest>();
        // SAFETY: iocbpp points to nr valid iocb pointers; buffer lifetimes
        // are the caller's obligation.
        let rv =
            unsafe { libc::syscall(libc::SYS_io_submit, self.ctx, nr as libc::c_long, iocbpp) };
        if rv == -1 {
            return Err(IoError::last_os_error("io_submit"));
        }
        assert_eq!(rv as usize, nr, "partial AIO submission");
        Ok(())
    }

    /// Reaps between `min_nr` and `events.len()` completions.
    ///
    /// Without a timeout this blocks until `min_nr` events are available.
    /// Interrupted waits are retried.
    pub fn get_events(
        &self,
        min_nr: usize,
        events: &mut [IoEvent],
        timeout: Option<Duration>,
    ) -> IoResult<usize> {
        let max_nr = events.len();
        assert!(min_nr <= max_nr, "min_nr {min_nr} exceeds capacity {max_nr}");

        let started = Instant::now();
        loop {
            // An interrupted wait resumes with whatever is left of the
            // original timeout, not a fresh one.
            let mut ts = timeout.map(|d| to_timespec(remaining(d, started.elapsed())));
            let ts_ptr = ts
                .as_mut()
                .map_or(std::ptr::null_mut(), std::ptr::from_mut);

            // SAFETY: events has room for max_nr records; ts_ptr is null or valid.
            let rv = unsafe {
                libc::syscall(
                    libc::SYS_io_getevents,
                    self.ctx,
                    min_nr as libc::c_long,
                    max_nr as libc::c_long,
                    events.as_mut_ptr(),
                    ts_ptr,
                )
            };
            if rv == -1 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(IoError::os("io_getevents", err));
            }

            let n = rv as usize;
            assert!(n <= max_nr, "kernel returned {n} events for {max_nr} slots");
            if timeout.is_none() {
                assert!(n >= min_nr, "kernel returned {n} events, wanted {min_nr}");
            }
            return Ok(n);
        }
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        if let Err(err) = io_destroy(self.ctx) {
            tracing::warn!(error = %err, "failed to destroy AIO context");
        }
    }
}

/// Part of `timeout` not yet used up after `elapsed`.
fn remaining(timeout: Duration, elapsed: Duration) -> Duration {
    timeout.saturating_sub(elapsed)
}

fn to_timespec(d: Duration) -> libc::timespec {
    // SAFETY: timespec is plain data; all-zero is a valid value.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    ts.tv_sec = d.as_secs() as libc::time_t;
    ts.tv_nsec = d.subsec_nanos() as _;
    ts
}

fn io_destroy(ctx: RawContext) -> IoResult<()> {
    // SAFETY: ctx came from io_setup and is destroyed only once.
    if unsafe { libc::syscall(libc::SYS_io_destroy, ctx) } == -1 {
        return Err(IoError::last_os_error("io_destroy"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::fd::AsRawFd;

    use super::*;
    use crate::fs::{self, OpenFlags};

    #[test]
    fn abi_layout_matches_kernel() {
        assert_eq!(size_of::<IoRequest>(), 64);
        assert_eq!(size_of::<IoEvent>(), 32);
    }

    #[test]
    fn context_create_and_destroy() {
        let ctx = AioContext::new(4).unwrap();
        ctx.destroy().unwrap();
    }

    #[test]
    fn dropped_context_is_released() {
        drop(AioContext::new(1).unwrap());
    }

    #[test]
    fn buffered_write_completes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aio.dat");
        let handle = fs::open(&path, OpenFlags::create_new()).unwrap();
        let data = b"replicated log entry";

        let ctx = AioContext::new(1).unwrap();
        let mut req = IoRequest::pwrite(handle.as_raw_fd(), data.as_ptr(), data.len(), 0).with_data(7);
        // SAFETY: `data` is static and outlives the reap below.
        unsafe { ctx.submit(&mut [&mut req]).unwrap() };

        let mut events = [IoEvent::default()];
        assert_eq!(ctx.get_events(1, &mut events, None).unwrap(), 1);
        assert_eq!(events[0].data(), 7);
        assert_eq!(events[0].into_result("pwrite").unwrap(), data.len());
        ctx.destroy().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[test]
    fn completion_signals_eventfd() {
        let dir = tempfile::tempdir().unwrap();
        let handle = fs::open(&dir.path().join("notify.dat"), OpenFlags::create_new()).unwrap();
        let efd = fs::eventfd(0, 0).unwrap();
        let data = [1u8; 512];

        let ctx = AioContext::new(1).unwrap();
        let mut req = IoRequest::pwrite(handle.as_raw_fd(), data.as_ptr(), data.len(), 0)
            .with_eventfd(efd.as_raw_fd());
        // SAFETY: `data` outlives the reap below.
        unsafe { ctx.submit(&mut [&mut req]).unwrap() };
        let mut events = [IoEvent::default()];
        ctx.get_events(1, &mut events, None).unwrap();

        let mut counter = [0u8; 8];
        std::fs::File::from(efd).read_exact(&mut counter).unwrap();
        assert_eq!(u64::from_ne_bytes(counter), 1);
    }

    #[test]
    fn get_events_times_out_empty() {
        let ctx = AioContext::new(1).unwrap();
        let mut events = [IoEvent::default()];
        let n = ctx
            .get_events(0, &mut events, Some(Duration::from_millis(1)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn get_events_waits_about_the_timeout() {
        let ctx = AioContext::new(1).unwrap();
        let mut events = [IoEvent::default()];
        let started = Instant::now();
        let n = ctx
            .get_events(1, &mut events, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(n, 0);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(40), "{waited:?}");
        assert!(waited < Duration::from_secs(5), "{waited:?}");
    }

    #[test]
    fn retried_wait_uses_what_is_left() {
        let timeout = Duration::from_millis(100);
        assert_eq!(remaining(timeout, Duration::ZERO), timeout);
        assert_eq!(remaining(timeout, Duration::from_millis(30)), Duration::from_millis(70));
        assert_eq!(remaining(timeout, Duration::from_secs(1)), Duration::ZERO);

        let ts = to_timespec(Duration::new(2, 500));
        assert_eq!((ts.tv_sec, ts.tv_nsec), (2, 500));
    }

    #[test]
    fn submit_to_bad_descriptor_fails() {
        let ctx = AioContext::new(1).unwrap();
        let data = [0u8; 512];
        let mut req = IoRequest::pwrite(-1, data.as_ptr(), data.len(), 0);
        // SAFETY: the request is rejected before any I/O starts.
        let err = unsafe { ctx.submit(&mut [&mut req]) }.unwrap_err();
        assert_eq!(err.op(), Some("io_submit"));
        assert_eq!(err.errno(), Some(libc::EBADF));
    }
}
