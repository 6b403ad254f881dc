//! Startup probing of kernel write capabilities.
//!
//! Whether direct I/O, kernel AIO, and the per-request `RWF_*` flags are
//! usable depends on the kernel and the filesystem backing the data
//! directory, so it is probed once against a scratch file at startup and
//! recorded; the writer branches on the recorded struct at runtime.

use std::path::Path;

/// What the disk writer may use on this data directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteCapabilities {
    /// Kernel AIO contexts can be created.
    pub aio: bool,
    /// Files accept `O_DIRECT`.
    pub direct: bool,
    /// `io_submit` honours `RWF_DSYNC` (else segments open `O_DSYNC`).
    pub dsync: bool,
    /// `io_submit` honours `RWF_NOWAIT`.
    pub nowait: bool,
    /// `io_submit` honours `RWF_HIPRI`.
    pub hipri: bool,
}

#[cfg(target_os = "linux")]
pub fn probe(dir: &Path) -> WriteCapabilities {
    use crate::aio::{self, AioContext};
    use crate::segment::{AlignedBuf, BLOCK_SIZE};
    use std::fs::OpenOptions;
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::OpenOptionsExt;

    let mut caps = WriteCapabilities::default();
    let probe_path = dir.join(".probe");

    caps.direct = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .custom_flags(libc::O_DIRECT)
        .open(&probe_path)
        .is_ok();

    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe_path)
    {
        Ok(f) => f,
        Err(err) => {
            tracing::warn!(%err, "capability probe could not create its scratch file");
            return caps;
        }
    };

    if let Ok(ctx) = AioContext::new(4) {
        caps.aio = true;

        let mut buf = AlignedBuf::zeroed(BLOCK_SIZE);
        buf.extend_from_slice(&[0u8; BLOCK_SIZE]);

        let mut try_flag = |flag: i32| -> bool {
            let mut iocb =
                aio::write_iocb(0, file.as_raw_fd(), buf.as_slice(), 0, flag);
            match ctx.submit(&mut iocb) {
                Ok(()) => match ctx.wait_blocking(1000) {
                    Some(event) => event.res >= 0,
                    None => false,
                },
                // EAGAIN from NOWAIT means the flag was understood.
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => true,
                Err(_) => false,
            }
        };

        caps.dsync = try_flag(aio::RWF_DSYNC);
        caps.nowait = try_flag(aio::RWF_NOWAIT);
        caps.hipri = try_flag(aio::RWF_HIPRI);
    }

    drop(file);
    let _ = std::fs::remove_file(&probe_path);

    tracing::debug!(?caps, "probed disk write capabilities");
    caps
}

#[cfg(not(target_os = "linux"))]
pub fn probe(_dir: &Path) -> WriteCapabilities {
    WriteCapabilities::default()
}
