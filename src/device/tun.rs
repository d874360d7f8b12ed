//! TUN file descriptor device

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{closed_error, PacketDevice};
use crate::error::DeviceError;

#[cfg(target_os = "linux")]
const TUNSETIFF: u64 = 0x4004_54ca;

/// `struct ifreq` with the flags member of its union
#[cfg(target_os = "linux")]
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// A TUN interface in non-blocking mode
///
/// The descriptor must deliver bare IP packets (`IFF_NO_PI` on Linux).
#[derive(Debug)]
pub struct TunDevice {
    fd: AsyncFd<File>,
    name: Option<String>,
    closed: CancellationToken,
}

impl TunDevice {
    /// Take ownership of an already-open TUN descriptor, e.g. one handed
    /// over by a platform VPN API.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::Open` if the descriptor cannot be made
    /// non-blocking or registered with the reactor.
    pub fn from_fd(fd: OwnedFd) -> Result<Self, DeviceError> {
        let raw = fd.as_raw_fd();
        set_nonblocking(raw).map_err(|e| DeviceError::Open {
            name: format!("fd {raw}"),
            reason: e.to_string(),
        })?;
        let fd = AsyncFd::new(File::from(fd)).map_err(|e| DeviceError::Open {
            name: format!("fd {raw}"),
            reason: e.to_string(),
        })?;
        info!(fd = raw, "TUN device attached");
        Ok(Self {
            fd,
            name: None,
            closed: CancellationToken::new(),
        })
    }

    /// Open (or create) interface `name` through `/dev/net/tun`
    ///
    /// Requires `CAP_NET_ADMIN`. Addresses and routes are left to the caller.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::Open` if the clone device cannot be opened or
    /// `TUNSETIFF` fails.
    #[cfg(target_os = "linux")]
    pub fn open(name: &str) -> Result<Self, DeviceError> {
        let open_err = |e: io::Error| DeviceError::Open {
            name: name.to_string(),
            reason: e.to_string(),
        };

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(open_err)?;

        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes().take(libc::IFNAMSIZ - 1)) {
            *dst = src as libc::c_char;
        }

        // SAFETY: file is an open /dev/net/tun descriptor and req outlives the call.
        let ret = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                TUNSETIFF as _,
                std::ptr::addr_of_mut!(req),
            )
        };
        if ret < 0 {
            return Err(open_err(io::Error::last_os_error()));
        }

        let mut device = Self::from_fd(OwnedFd::from(file))?;
        device.name = Some(name.to_string());
        info!(name, "TUN device opened");
        Ok(device)
    }

    /// Interface name, if the device was opened by name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[async_trait]
impl PacketDevice for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = tokio::select! {
                () = self.closed.cancelled() => return Err(closed_error()),
                guard = self.fd.readable() => guard?,
            };
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(packet)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFL on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: F_SETFL with the flags just read plus O_NONBLOCK.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
