//! Kernel AIO submission with eventfd completion signalling.
//!
//! The preferred disk path on Linux: writes are submitted with
//! `io_submit(2)` carrying `IOCB_FLAG_RESFD`, so completions bump an
//! eventfd that the tokio reactor polls through [`AsyncFd`]. The eventfd
//! counter is an advisory wake only; every wake drains the completion
//! ring with `io_getevents(2)` until it is empty.

#![cfg(target_os = "linux")]

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;

pub const IOCB_CMD_PWRITE: u16 = 1;
pub const IOCB_FLAG_RESFD: u32 = 1;

pub const RWF_HIPRI: i32 = 0x1;
pub const RWF_DSYNC: i32 = 0x2;
pub const RWF_NOWAIT: i32 = 0x8;

/// `struct iocb` from `linux/aio_abi.h`, little-endian field order.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Iocb {
    pub aio_data: u64,
    pub aio_key: u32,
    pub aio_rw_flags: i32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

/// `struct io_event` from `linux/aio_abi.h`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct IoEvent {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

/// A kernel AIO context plus the eventfd its completions signal.
pub struct AioContext {
    ctx: u64,
    eventfd: AsyncFd<OwnedFd>,
}

impl AioContext {
    /// Set up a context able to hold `depth` concurrent requests.
    pub fn new(depth: u32) -> io::Result<Self> {
        let mut ctx: u64 = 0;
        let rc = unsafe { libc::syscall(libc::SYS_io_setup, depth, &mut ctx as *mut u64) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
            return Err(err);
        }
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        let eventfd = AsyncFd::new(owned)?;

        Ok(Self { ctx, eventfd })
    }

    /// Submit one write, wiring its completion to the eventfd.
    ///
    /// Returns `WouldBlock` when the kernel cannot take the request
    /// without blocking (`EAGAIN`, or a `RWF_NOWAIT` refusal), in which
    /// case the caller falls back to a worker thread.
    pub fn submit(&self, iocb: &mut Iocb) -> io::Result<()> {
        iocb.aio_flags |= IOCB_FLAG_RESFD;
        iocb.aio_resfd = self.eventfd.get_ref().as_raw_fd() as u32;

        let mut ptrs = [iocb as *mut Iocb];
        let rc = unsafe { libc::syscall(libc::SYS_io_submit, self.ctx, 1i64, ptrs.as_mut_ptr()) };
        if rc == 1 {
            return Ok(());
        }
        if rc == 0 {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        Err(err)
    }

    /// Wait until at least one completion is likely ready.
    ///
    /// Reads and discards the eventfd counter: it is only a wake-up, the
    /// authoritative completion list comes from [`Self::drain`].
    pub async fn ready(&self) -> io::Result<()> {
        loop {
            let mut guard = self.eventfd.readable().await?;
            let read_result = guard.try_io(|fd| {
                let mut counter = [0u8; 8];
                let n = unsafe {
                    libc::read(
                        fd.get_ref().as_raw_fd(),
                        counter.as_mut_ptr() as *mut libc::c_void,
                        8,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
            match read_result {
                Ok(result) => return result,
                // Spurious readiness; poll again.
                Err(_would_block) => continue,
            }
        }
    }

    /// Block for up to `timeout_ms` for a single completion.
    ///
    /// Only used by the startup capability probe, which runs before the
    /// writer task exists.
    pub fn wait_blocking(&self, timeout_ms: i64) -> Option<IoEvent> {
        let mut event = IoEvent::default();
        let mut timeout = libc::timespec {
            tv_sec: timeout_ms / 1000,
            tv_nsec: (timeout_ms % 1000) * 1_000_000,
        };
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.ctx,
                1i64,
                1i64,
                &mut event as *mut IoEvent,
                &mut timeout as *mut libc::timespec,
            )
        };
        (rc == 1).then_some(event)
    }

    /// Collect every completed event without blocking.
    pub fn drain(&self) -> io::Result<Vec<IoEvent>> {
        let mut events = Vec::new();
        let mut batch = [IoEvent::default(); 32];
        loop {
            let mut timeout = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_io_getevents,
                    self.ctx,
                    0i64,
                    batch.len() as i64,
                    batch.as_mut_ptr(),
                    &mut timeout as *mut libc::timespec,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            let n = rc as usize;
            events.extend_from_slice(&batch[..n]);
            if n < batch.len() {
                return Ok(events);
            }
        }
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        unsafe {
            libc::syscall(libc::SYS_io_destroy, self.ctx);
        }
    }
}

/// Build a pwrite iocb for `fd` at `offset`.
pub fn write_iocb(id: u64, fd: i32, buf: &[u8], offset: u64, rw_flags: i32) -> Iocb {
    Iocb {
        aio_data: id,
        aio_lio_opcode: IOCB_CMD_PWRITE,
        aio_fildes: fd as u32,
        aio_buf: buf.as_ptr() as u64,
        aio_nbytes: buf.len() as u64,
        aio_offset: offset as i64,
        aio_rw_flags: rw_flags,
        ..Iocb::default()
    }
}
