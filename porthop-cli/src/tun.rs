//! Driving a pre-opened TUN device.
//!
//! Device creation, addressing and routing are left to whatever opened the
//! fd (a wrapper script, systemd, a privileged helper). This wrapper only
//! moves frames through it asynchronously.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;

use porthop_protocol::transport::TunTransport;

pub struct FdTun {
    fd: AsyncFd<OwnedFd>,
    mtu: usize,
}

impl FdTun {
    /// Takes ownership of `raw`, which must be an open TUN device fd.
    pub fn from_raw_fd(raw: RawFd, mtu: usize) -> io::Result<FdTun> {
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        set_nonblocking(&owned)?;
        Ok(FdTun {
            fd: AsyncFd::new(owned)?,
            mtu,
        })
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[async_trait]
impl TunTransport for FdTun {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                let raw = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::read(raw, buf.as_mut_ptr().cast(), buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(read) => return read,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                let raw = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::write(raw, frame.as_ptr().cast(), frame.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(written) => {
                    written?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}
