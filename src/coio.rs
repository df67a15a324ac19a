//! Cooperative input/output
//!
//! Socket wrappers that go through the [hook layer](../hook/index.html):
//! inside the runtime a read or write that would block parks the calling
//! fiber on the [reactor](../reactor/index.html) instead of blocking its
//! worker thread; outside the runtime the same calls degrade to their plain
//! blocking equivalents.
use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::mem::forget;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use crate::hook;

/// Polls read/write readiness through the reactor instead of blocking the
/// worker thread.
pub struct CoStream {
    fd: RawFd,
}

impl CoStream {
    /// Wrap an fd-like object, switching it to non-blocking mode.
    pub fn new<T>(inner: T) -> Result<CoStream, io::Error>
    where
        T: IntoRawFd,
    {
        let fd = inner.into_raw_fd();
        set_nonblocking(fd)?;
        Ok(CoStream { fd })
    }

    /// Connect to a remote TCP socket, honoring `tcp.connect.timeout`.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<CoStream, io::Error> {
        let timeout = hook::connect_timeout_ms();
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match Self::connect_addr(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to")
        }))
    }

    /// Open a TCP connection to a remote host with an explicit timeout.
    pub fn connect_timeout(addr: &SocketAddr, timeout: Duration) -> Result<CoStream, io::Error> {
        Self::connect_addr(addr, timeout.as_millis() as u64)
    }

    fn connect_addr(addr: &SocketAddr, timeout_ms: u64) -> Result<CoStream, io::Error> {
        let (family, storage, len) = raw_sockaddr(addr);
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let raw = &storage as *const libc::sockaddr_storage as *const libc::sockaddr;
        if let Err(e) = hook::connect_with_timeout(fd, raw, len, timeout_ms) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(CoStream { fd })
    }
}

impl IntoRawFd for CoStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        forget(self);
        fd
    }
}

impl AsRawFd for CoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Read for CoStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        hook::read(self.fd, buf)
    }
}

impl Write for CoStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        hook::write(self.fd, buf)
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

impl Drop for CoStream {
    fn drop(&mut self) {
        let _ = hook::close(self.fd);
    }
}

/// Accepts incoming connections without blocking the worker thread.
pub struct CoListener {
    inner: TcpListener,
}

impl CoListener {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<CoListener, io::Error> {
        CoListener::try_from(TcpListener::bind(addr)?)
    }

    /// Accept a new incoming connection from this listener.
    pub fn accept(&self) -> Result<CoStream, io::Error> {
        let fd = hook::accept(self.inner.as_raw_fd())?;
        set_nonblocking(fd)?;
        Ok(CoStream { fd })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.inner.local_addr()
    }

    pub fn inner_listener(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

impl TryFrom<TcpListener> for CoListener {
    type Error = io::Error;

    fn try_from(value: TcpListener) -> Result<Self, Self::Error> {
        value.set_nonblocking(true)?;
        Ok(Self { inner: value })
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), io::Error> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn raw_sockaddr(addr: &SocketAddr) -> (libc::c_int, libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            (
                libc::AF_INET,
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            (
                libc::AF_INET6,
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}
