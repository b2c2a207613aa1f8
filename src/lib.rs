//! A reactor-pattern, epoll-backed TCP networking core for Linux: a
//! multi-threaded, non-blocking I/O runtime that multiplexes many TCP
//! connections across a fixed pool of I/O loops.
//!
//! The crate is organized in two layers:
//!
//! - [`epoll`] is the low-level readiness API: a thin, safe wrapper over
//!   `epoll_create1`/`epoll_ctl`/`epoll_wait` with its own token/readiness
//!   vocabulary (`Epoll`, `Token`, `Ready`, `EpollOpt`). Callers who want
//!   raw register/modify/delete semantics without any callback dispatch use
//!   this directly.
//! - [`reactor`] is the callback-dispatching runtime built on top of it: a
//!   per-thread [`reactor::EventLoop`], a [`reactor::Channel`] binding one
//!   fd's readiness to typed callbacks, a [`reactor::TimerQueue`], and the
//!   [`reactor::TcpServer`]/[`reactor::TcpClient`] pair most applications
//!   actually drive.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use reactor_io::reactor::{Buffer, EventLoop, InetAddress, Timestamp, TcpServer, TcpConnectionRef};
//!
//! let base_loop = EventLoop::new().unwrap();
//! let listen_addr = InetAddress::new(8888, false, false);
//! let server = TcpServer::new(base_loop.clone(), listen_addr, "echo".to_string(), false);
//!
//! server.set_message_callback(Arc::new(|conn: &TcpConnectionRef, buf: &mut Buffer, _receive_time: Timestamp| {
//!     let data = buf.retrieve_all_as_vec();
//!     conn.send(&data);
//! }));
//!
//! server.set_thread_num(4);
//! server.start().unwrap();
//! base_loop.run();
//! ```

#[macro_use]
mod sys;

pub mod epoll;
pub mod reactor;

pub use epoll::{Epoll, EpollOpt, Event, Events, Ready, Token};
pub use reactor::{EventLoop, TcpClient, TcpConnection, TcpConnectionRef, TcpServer};
