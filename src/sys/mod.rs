//! Thin wrappers around raw Linux syscalls shared by the rest of the crate.

use std::io;
use libc::c_int;

macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Turns a `-1` return value from a libc call into an `io::Error`, leaving
/// anything else untouched. Used where the raw return value itself (not just
/// success/failure) is needed, unlike `syscall!`.
pub(crate) fn cvt(res: c_int) -> io::Result<c_int> {
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

mod commom;
mod fd;
mod socket;
mod epoll;
mod eventfd;

pub use commom::{AsInner, AsInnerMut, FromInner, IntoInner};
pub use fd::FileDesc;
pub use socket::Socket;
pub use epoll::{Epoll, Events};
pub use eventfd::EventFd;
