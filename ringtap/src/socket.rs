//! Thin wrappers over the `AF_PACKET` socket syscalls.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use ringtap_common::{
    SockaddrLl, ETH_P_ALL, PACKET_RX_RING, PACKET_VERSION, SOL_PACKET,
};

use crate::error::{Error, Result};
use crate::options::{RingGeometry, SocketType, TpacketVersion};

/// An open packet socket. The descriptor closes on drop.
pub(crate) struct SocketHandle {
    fd: OwnedFd,
}

impl SocketHandle {
    pub(crate) fn open(socket_type: SocketType) -> Result<Self> {
        // SAFETY: socket has no memory-safety preconditions.
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                socket_type.as_raw() | libc::SOCK_CLOEXEC,
                i32::from(ETH_P_ALL.to_be()),
            )
        };
        if fd < 0 {
            return Err(Error::syscall("socket"));
        }
        // SAFETY: fd was just returned by socket(2) and is owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Bind to `ifindex`; zero means every interface.
    pub(crate) fn bind(&self, ifindex: i32) -> Result<()> {
        let addr = SockaddrLl {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: ETH_P_ALL.to_be(),
            sll_ifindex: ifindex,
            ..Default::default()
        };
        // SAFETY: addr is a valid sockaddr_ll of the length passed.
        let rc = unsafe {
            libc::bind(
                self.raw(),
                &addr as *const SockaddrLl as *const libc::sockaddr,
                mem::size_of::<SockaddrLl>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(Error::syscall("bind"));
        }
        Ok(())
    }

    pub(crate) fn set_version(&self, version: TpacketVersion) -> io::Result<()> {
        self.setsockopt(SOL_PACKET, PACKET_VERSION, &version.as_raw())
    }

    /// Ask the kernel to allocate the receive ring.
    pub(crate) fn request_ring(
        &self,
        version: TpacketVersion,
        geometry: &RingGeometry,
    ) -> Result<()> {
        let rc = match version {
            TpacketVersion::V1 | TpacketVersion::V2 => {
                self.setsockopt(SOL_PACKET, PACKET_RX_RING, &geometry.request())
            }
            TpacketVersion::V3 => {
                self.setsockopt(SOL_PACKET, PACKET_RX_RING, &geometry.request_v3())
            }
        };
        rc.map_err(|source| Error::Setup {
            op: "setsockopt(PACKET_RX_RING)",
            source,
        })
    }

    pub(crate) fn setsockopt<T>(&self, level: i32, name: i32, value: &T) -> io::Result<()> {
        // SAFETY: value points to size_of::<T>() readable bytes.
        let rc = unsafe {
            libc::setsockopt(
                self.raw(),
                level,
                name,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// `T` must be a plain `repr(C)` struct the kernel may fill byte for byte.
    pub(crate) fn getsockopt<T: Default>(&self, level: i32, name: i32) -> io::Result<T> {
        let mut value = T::default();
        let mut len = mem::size_of::<T>() as libc::socklen_t;
        // SAFETY: value provides len writable bytes; callers only use
        // integer-only repr(C) types.
        let rc = unsafe {
            libc::getsockopt(
                self.raw(),
                level,
                name,
                &mut value as *mut T as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }

    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for buf.len() bytes.
        let n = unsafe { libc::write(self.raw(), buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// An ordinary unprivileged socket, for exercising error paths.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let sock = std::os::unix::net::UnixDatagram::unbound().unwrap();
        Self {
            fd: OwnedFd::from(sock),
        }
    }
}

/// Resolve an interface name to its index. The empty name is index 0, which
/// binds to every interface.
pub fn interface_index(name: &str) -> Result<i32> {
    if name.is_empty() {
        return Ok(0);
    }
    let cname = CString::new(name)
        .map_err(|_| Error::config(format!("interface name {name:?} contains a NUL byte")))?;
    // SAFETY: cname is a valid NUL-terminated string.
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(Error::config_os(
            format!("interface {name:?} not found"),
            io::Error::last_os_error(),
        ));
    }
    Ok(index as i32)
}
