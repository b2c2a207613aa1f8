use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{self, c_int, sockaddr, sockaddr_storage, socklen_t};

use crate::sys::{self, AsInner};

use super::inet_address::InetAddress;

/// A non-blocking TCP socket. Thin wrapper over `sys::Socket` adding the
/// bind/listen/accept/option calls the reactor needs, grounded in the same
/// raw-syscall style as the rest of `sys::*`.
pub struct Socket {
    inner: sys::Socket,
}

impl Socket {
    pub fn new_stream(addr: &SocketAddr) -> io::Result<Socket> {
        let inner = sys::Socket::new(addr, libc::SOCK_STREAM)?;
        Ok(Socket { inner })
    }

    pub fn from_raw(inner: sys::Socket) -> Socket {
        Socket { inner }
    }

    pub fn bind_address(&self, addr: &InetAddress) -> io::Result<()> {
        let sock_addr = addr.as_socket_addr();
        let (addrp, len) = socket_addr_ptr(&sock_addr);
        syscall!(bind(self.as_raw_fd(), addrp, len))?;
        Ok(())
    }

    pub fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.as_raw_fd(), libc::SOMAXCONN))?;
        Ok(())
    }

    pub fn connect(&self, addr: &InetAddress) -> io::Result<()> {
        let sock_addr = addr.as_socket_addr();
        let (addrp, len) = socket_addr_ptr(&sock_addr);
        match syscall!(connect(self.as_raw_fd(), addrp, len)) {
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Accepts one pending connection, returning the new (non-blocking)
    /// socket and the peer's address, or `None` if nothing is pending.
    pub fn accept(&self) -> io::Result<(Socket, InetAddress)> {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let accepted = self.inner.accept(
            &mut storage as *mut _ as *mut sockaddr,
            &mut len as *mut socklen_t,
        )?;
        accepted.set_nonblocking(true)?;

        let peer = sockaddr_storage_to_addr(&storage, len as usize)?;
        Ok((Socket { inner: accepted }, InetAddress::from_socket_addr(peer)))
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Write)
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        setsockopt_bool(self.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        setsockopt_bool(self.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        setsockopt_bool(self.as_raw_fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    pub fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        self.inner.set_nonblocking(on)
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    pub fn local_addr(&self) -> io::Result<InetAddress> {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getsockname(self.as_raw_fd(), &mut storage as *mut _ as *mut sockaddr, &mut len))?;
        sockaddr_storage_to_addr(&storage, len as usize).map(InetAddress::from_socket_addr)
    }

    pub fn peer_addr(&self) -> io::Result<InetAddress> {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getpeername(self.as_raw_fd(), &mut storage as *mut _ as *mut sockaddr, &mut len))?;
        sockaddr_storage_to_addr(&storage, len as usize).map(InetAddress::from_socket_addr)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        *self.inner.as_inner()
    }
}

fn socket_addr_ptr(addr: &SocketAddr) -> (*const sockaddr, socklen_t) {
    match addr {
        SocketAddr::V4(a) => (a as *const _ as *const sockaddr, mem::size_of_val(a) as socklen_t),
        SocketAddr::V6(a) => (a as *const _ as *const sockaddr, mem::size_of_val(a) as socklen_t),
    }
}

fn sockaddr_storage_to_addr(storage: &sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let addr: libc::sockaddr_in = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Ok(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let addr: libc::sockaddr_in6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(SocketAddr::new(ip.into(), u16::from_be(addr.sin6_port)))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "unsupported address family")),
    }
}

fn setsockopt_bool(fd: RawFd, level: c_int, name: c_int, on: bool) -> io::Result<()> {
    let val: c_int = on as c_int;
    syscall!(setsockopt(
        fd,
        level,
        name,
        &val as *const c_int as *const libc::c_void,
        mem::size_of::<c_int>() as socklen_t
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listen_accept_connect_roundtrip() {
        let listen_addr = InetAddress::new(0, true, false);
        let listener = Socket::new_stream(&listen_addr.as_socket_addr()).unwrap();
        listener.set_reuse_addr(true).unwrap();
        listener.bind_address(&listen_addr).unwrap();
        listener.listen().unwrap();

        let bound = listener.local_addr().unwrap();

        let client = Socket::new_stream(&bound.as_socket_addr()).unwrap();
        client.set_nonblocking(true).unwrap();
        let _ = client.connect(&bound);

        std::thread::sleep(std::time::Duration::from_millis(50));

        let (_server_side, peer) = listener.accept().unwrap();
        assert_eq!(peer.ip(), "127.0.0.1");
    }
}
