//! The listening socket shared by every worker.
//!
//! The supervisor binds the service address exactly once. Workers inherit the
//! descriptor across `exec` and find its number in `BERTH_LISTEN_FD`; the
//! kernel serializes `accept` between them.

use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};

use berth_common::constants::LISTEN_FD_ENV;
use berth_common::error::{BerthError, Result};
use tokio::process::Command;

/// A bound TCP listener whose descriptor is handed to worker processes.
#[derive(Debug)]
pub struct SharedListener {
    socket: TcpListener,
    addr: SocketAddr,
}

impl SharedListener {
    /// Binds `addr` on behalf of `network`.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::NetworkAttachment` if the address cannot be bound.
    pub fn bind(addr: SocketAddr, network: &str) -> Result<Self> {
        let socket = TcpListener::bind(addr).map_err(|e| BerthError::NetworkAttachment {
            network: network.to_string(),
            message: format!("cannot bind {addr}: {e}"),
        })?;
        let addr = socket.local_addr().map_err(|e| BerthError::NetworkAttachment {
            network: network.to_string(),
            message: format!("bound socket has no address: {e}"),
        })?;
        tracing::info!(%addr, network, "bound service socket");
        Ok(Self { socket, addr })
    }

    /// Returns the bound address, with the kernel-assigned port resolved.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the raw descriptor number.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Arranges for `cmd`'s child to inherit the socket and announces the
    /// descriptor number in its environment.
    pub fn share_with(&self, cmd: &mut Command) {
        let fd = self.raw_fd();
        let _ = cmd.env(LISTEN_FD_ENV, fd.to_string());
        // SAFETY: the closure runs in the forked child before exec and only
        // issues a single fcntl on a descriptor this process owns, which is
        // async-signal-safe.
        unsafe {
            let _ = cmd.pre_exec(move || {
                if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
}
