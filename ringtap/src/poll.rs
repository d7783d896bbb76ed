//! Blocking wait for the kernel to hand a slot over.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Outcome of one `poll(2)` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    TimedOut,
    /// POLLERR on the packet socket.
    Failed,
    /// EINTR. Callers retry.
    Interrupted,
    /// The handle is closing.
    Woken,
}

pub(crate) trait Wait {
    fn wait(&self, timeout_ms: i32) -> io::Result<Readiness>;
}

/// Polls the packet socket together with the close waker.
pub(crate) struct SocketWaiter {
    socket: RawFd,
    waker: RawFd,
}

impl SocketWaiter {
    pub(crate) fn new(socket: RawFd, waker: &Waker) -> Self {
        Self {
            socket,
            waker: waker.as_raw_fd(),
        }
    }
}

impl Wait for SocketWaiter {
    fn wait(&self, timeout_ms: i32) -> io::Result<Readiness> {
        let mut fds = [
            libc::pollfd {
                fd: self.socket,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.waker,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        // SAFETY: fds is a valid array of two pollfd entries.
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::Interrupted);
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(Readiness::TimedOut);
        }
        if fds[1].revents & libc::POLLIN != 0 {
            return Ok(Readiness::Woken);
        }
        if fds[0].revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Ok(Readiness::Failed);
        }
        Ok(Readiness::Ready)
    }
}

/// eventfd that wakes a reader blocked in poll when the handle closes.
pub(crate) struct Waker(OwnedFd);

impl Waker {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: eventfd has no memory-safety preconditions; the result is
        // checked before it is wrapped.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created descriptor nobody else owns.
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Leaves the eventfd readable for good: every later poll returns at once.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        // SAFETY: writes exactly the 8 bytes of `one`.
        let n = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_woken_waiter_returns_immediately() {
        let waker = Waker::new().unwrap();
        let idle = Waker::new().unwrap();
        let waiter = SocketWaiter::new(idle.as_raw_fd(), &waker);

        assert_eq!(waiter.wait(0).unwrap(), Readiness::TimedOut);
        waker.wake().unwrap();
        assert_eq!(waiter.wait(1000).unwrap(), Readiness::Woken);
        assert_eq!(waiter.wait(1000).unwrap(), Readiness::Woken);
    }

    #[test]
    fn test_readable_socket_is_ready() {
        let waker = Waker::new().unwrap();
        let socket = Waker::new().unwrap();
        socket.wake().unwrap();
        let waiter = SocketWaiter::new(socket.as_raw_fd(), &waker);
        assert_eq!(waiter.wait(1000).unwrap(), Readiness::Ready);
    }
}
