//! A thread-per-loop reactor built on top of `sys::epoll`/`crate::epoll`.
//!
//! `EventLoop` owns a `Poller`, a `TimerQueue` and a cross-thread task queue;
//! `TcpServer`/`TcpClient` compose `Acceptor`/`Connector` and
//! `TcpConnection` on top of it to turn raw readiness events into a
//! connection's read/write/close callbacks.

pub mod timestamp;
pub mod buffer;
pub mod inet_address;
pub mod socket;
pub mod channel;
pub mod poller;
pub mod timer;
pub mod event_loop;
pub mod event_loop_thread;
pub mod acceptor;
pub mod connector;
pub mod tcp_connection;
pub mod tcp_server;
pub mod tcp_client;

pub use timestamp::Timestamp;
pub use buffer::Buffer;
pub use inet_address::InetAddress;
pub use socket::Socket;
pub use channel::Channel;
pub use poller::Poller;
pub use timer::{TimerId, TimerQueue};
pub use event_loop::EventLoop;
pub use event_loop_thread::{EventLoopThread, EventLoopThreadPool};
pub use acceptor::Acceptor;
pub use connector::Connector;
pub use tcp_connection::{TcpConnection, TcpConnectionRef};
pub use tcp_server::TcpServer;
pub use tcp_client::TcpClient;
