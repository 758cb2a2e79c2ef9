//! # tessera-io: durable-storage I/O layer for the Tessera log store
//!
//! This crate sits between the replicated log store and the operating system.
//! It decides, once at startup, how the log store may write to its data
//! directory, and provides the primitive file and memory operations the log
//! store is built on.
//!
//! - **[`heap`]**: process-wide, swappable allocator used for every buffer
//!   handed to the kernel, with an owning [`AlignedBuffer`] on top.
//! - **[`fs`]**: single-syscall file operations (open, write, fsync,
//!   fallocate, rename, ...) with errors that name the failing syscall.
//! - **`aio`** (Linux): kernel AIO context, submit and reap.
//! - **[`probe`]**: the capability probe that finds the Direct I/O alignment
//!   for a directory and whether non-blocking kernel AIO works there.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │              log store               │
//! │  probe_io_capabilities() at startup  │
//! │  -> ProbeResult -> WriteStrategy     │
//! └──────────────────┬───────────────────┘
//!                    │
//! ┌──────────────────┴───────────────────┐
//! │              tessera-io              │
//! │  ┌───────┐  ┌────┐  ┌─────┐  ┌─────┐ │
//! │  │ probe │─▶│ fs │  │ aio │  │heap │ │
//! │  └───┬───┘  └────┘  └─────┘  └─────┘ │
//! │      └────────▶ aio, heap            │
//! └──────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! let caps = tessera_io::probe_io_capabilities(Path::new("/var/lib/tessera"))?;
//! let flags = caps.write_strategy().open_flags();
//! let segment = tessera_io::fs::open(Path::new("/var/lib/tessera/open-1"), flags)?;
//! # drop(segment);
//! # Ok::<(), tessera_io::IoError>(())
//! ```

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub mod aio;
#[allow(unsafe_code)]
mod aligned;
mod config;
mod error;
#[allow(unsafe_code)]
pub mod fs;
#[allow(unsafe_code)]
pub mod heap;
#[allow(unsafe_code)]
pub mod probe;

pub use aligned::{AlignedBuffer, BLOCK_ALIGNMENT};
pub use config::{ProbeConfig, SECTOR_SIZE};
pub use error::{IoError, IoResult};
pub use fs::{FileHandle, OpenFlags};
pub use heap::{Heap, SystemHeap};
pub use probe::{ProbeResult, Prober, WriteStrategy, probe_io_capabilities};
