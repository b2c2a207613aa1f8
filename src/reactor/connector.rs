use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::os::unix::io::AsRawFd;

use log::{debug, error, info, warn};

use crate::epoll::Ready;

use super::channel::Channel;
use super::event_loop::{EventLoop, EventHost};
use super::inet_address::InetAddress;
use super::socket::Socket;
use super::timestamp::Timestamp;

const INIT_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// `connect(2)` failing with one of these means "try again shortly".
const RETRY_ERRNOS: [i32; 5] = [
    libc::EAGAIN,
    libc::EADDRINUSE,
    libc::EADDRNOTAVAIL,
    libc::ECONNREFUSED,
    libc::ENETUNREACH,
];

/// `connect(2)` returning one of these (including success) means the
/// connect attempt is in flight and completion is observed via writability.
const CONNECTING_ERRNOS: [i32; 2] = [libc::EINPROGRESS, libc::EINTR];

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

pub type NewConnectionCallback = Box<dyn Fn(Socket) + Send + Sync>;

/// Connects to one remote address, retrying with exponential backoff on
/// transient failure. Grounded on `Connector.hpp`/`Connector.cpp`: a fresh
/// nonblocking socket and `Channel` per attempt, writability (plus
/// `SO_ERROR`/self-connect checks) as the completion signal, 500 ms initial
/// backoff doubling to a 30 s cap.
///
/// Scheduled callbacks close over `Arc<Connector>` so the connector stays
/// alive until a retry or completion callback actually runs; it is always
/// constructed behind an `Arc` for that reason.
pub struct Connector {
    event_loop: Arc<EventLoop>,
    server_addr: InetAddress,
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: Mutex<u64>,
    attempt: Mutex<Option<(Socket, Channel)>>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Connector {
    pub fn new(event_loop: Arc<EventLoop>, server_addr: InetAddress) -> Arc<Connector> {
        Arc::new(Connector {
            event_loop,
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            retry_delay_ms: Mutex::new(INIT_RETRY_DELAY_MS),
            attempt: Mutex::new(None),
            new_connection_callback: Mutex::new(None),
        })
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_callback.lock().unwrap() = Some(cb);
    }

    pub fn server_addr(&self) -> &InetAddress {
        &self.server_addr
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::SeqCst) {
            0 => State::Disconnected,
            1 => State::Connecting,
            _ => State::Connected,
        }
    }

    /// Begins connecting, via `run_in_loop` so it is safe to call from any
    /// thread.
    pub fn start(self: &Arc<Self>) {
        self.connect.store(true, Ordering::SeqCst);
        let this = self.clone();
        self.event_loop.run_in_loop(Box::new(move || this.start_in_loop()));
    }

    /// Gives up wanting a connection. If an attempt is in flight its
    /// channel is torn down on the next pending-task pass; an established
    /// connection is unaffected (use `TcpClient::disconnect` for that).
    pub fn stop(self: &Arc<Self>) {
        self.connect.store(false, Ordering::SeqCst);
        let this = self.clone();
        self.event_loop.queue_in_loop(Box::new(move || this.stop_in_loop()));
    }

    /// Resets to the initial backoff and connects again, always through
    /// `start_in_loop` so restart shares a single control-flow path with
    /// a fresh `start()`.
    pub fn restart(self: &Arc<Self>) {
        self.connect.store(true, Ordering::SeqCst);
        self.state.store(State::Disconnected as u8, Ordering::SeqCst);
        *self.retry_delay_ms.lock().unwrap() = INIT_RETRY_DELAY_MS;

        let this = self.clone();
        self.event_loop.run_in_loop(Box::new(move || this.start_in_loop()));
    }

    fn start_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();

        if !self.connect.load(Ordering::SeqCst) {
            debug!("Connector: start_in_loop called but connect() was cancelled");
            return;
        }

        let socket = match Socket::new_stream(&self.server_addr.as_socket_addr()) {
            Ok(socket) => socket,
            Err(e) => {
                error!("Connector: failed to create socket: {}", e);
                return;
            }
        };

        if let Err(e) = socket.set_nonblocking(true) {
            error!("Connector: set_nonblocking failed: {}", e);
            return;
        }

        match socket.connect(&self.server_addr) {
            Ok(()) => self.connecting(socket),
            Err(e) => match e.raw_os_error() {
                Some(code) if CONNECTING_ERRNOS.contains(&code) => self.connecting(socket),
                Some(code) if RETRY_ERRNOS.contains(&code) => self.retry(socket),
                Some(code) => error!("Connector: giving up on connect, errno {}", code),
                None => error!("Connector: connect failed: {}", e),
            },
        }
    }

    fn connecting(self: &Arc<Self>, socket: Socket) {
        self.state.store(State::Connecting as u8, Ordering::SeqCst);

        let fd = socket.as_raw_fd();
        let weak_write = Arc::downgrade(self);
        let weak_error = weak_write.clone();

        let mut channel = Channel::new(fd);
        channel.set_write_callback(Box::new(move || {
            if let Some(connector) = weak_write.upgrade() {
                connector.handle_write();
            }
        }));
        channel.set_error_callback(Box::new(move || {
            if let Some(connector) = weak_error.upgrade() {
                connector.handle_error();
            }
        }));

        {
            let mut poller = self.event_loop.lock_poller();
            channel.enable_writing(&mut poller);
        }

        let host: Arc<dyn EventHost> = self.clone();
        self.event_loop.register_channel_host(fd, host);

        *self.attempt.lock().unwrap() = Some((socket, channel));
    }

    /// Takes the in-flight `(Socket, Channel)` out of `attempt`, tearing
    /// down its registration. Must only run from a pending task, never
    /// directly from `handle_write`/`handle_error` — those run while
    /// `dispatch` still holds `attempt`'s lock for the channel it was
    /// called through.
    fn take_attempt(&self) -> Option<(Socket, i32)> {
        let mut slot = self.attempt.lock().unwrap();
        slot.take().map(|(socket, mut channel)| {
            let fd = socket.as_raw_fd();
            let mut poller = self.event_loop.lock_poller();
            channel.disable_all(&mut poller);
            channel.remove(&mut poller);
            drop(poller);
            self.event_loop.unregister_channel_host(fd);
            (socket, fd)
        })
    }

    fn handle_write(self: &Arc<Self>) {
        if self.state() != State::Connecting {
            return;
        }
        let this = self.clone();
        self.event_loop.queue_in_loop(Box::new(move || this.complete_connecting()));
    }

    fn handle_error(self: &Arc<Self>) {
        if self.state() != State::Connecting {
            return;
        }
        let this = self.clone();
        self.event_loop.queue_in_loop(Box::new(move || {
            if let Some((socket, _fd)) = this.take_attempt() {
                if let Ok(Some(e)) = socket.take_error() {
                    warn!("Connector: error event, SO_ERROR = {}", e);
                }
                this.retry(socket);
            }
        }));
    }

    fn complete_connecting(self: &Arc<Self>) {
        let (socket, _fd) = match self.take_attempt() {
            Some(pair) => pair,
            None => return,
        };

        match socket.take_error() {
            Ok(None) if !self_connect(&socket) => {
                self.state.store(State::Connected as u8, Ordering::SeqCst);
                if self.connect.load(Ordering::SeqCst) {
                    let callback = self.new_connection_callback.lock().unwrap();
                    if let Some(cb) = callback.as_ref() {
                        cb(socket);
                    }
                }
            }
            Ok(None) => {
                warn!("Connector: self-connect detected, retrying");
                self.retry(socket);
            }
            Ok(Some(e)) => {
                warn!("Connector: SO_ERROR after connect: {}", e);
                self.retry(socket);
            }
            Err(e) => {
                warn!("Connector: take_error() failed: {}", e);
                self.retry(socket);
            }
        }
    }

    fn stop_in_loop(&self) {
        if self.state() == State::Connecting {
            if let Some((_socket, _fd)) = self.take_attempt() {
                self.state.store(State::Disconnected as u8, Ordering::SeqCst);
            }
        }
    }

    fn retry(self: &Arc<Self>, socket: Socket) {
        drop(socket);
        self.state.store(State::Disconnected as u8, Ordering::SeqCst);

        if !self.connect.load(Ordering::SeqCst) {
            debug!("Connector: not retrying, stop() was called");
            return;
        }

        let delay_ms = {
            let mut delay = self.retry_delay_ms.lock().unwrap();
            let scheduled = *delay;
            *delay = (*delay * 2).min(MAX_RETRY_DELAY_MS);
            scheduled
        };

        info!("Connector: retrying {} in {} ms", self.server_addr, delay_ms);
        let this = self.clone();
        self.event_loop.run_after(delay_ms as f64 / 1000.0, Box::new(move || {
            this.start_in_loop();
        }));
    }
}

impl EventHost for Connector {
    fn dispatch(&self, revents: Ready, receive_time: Timestamp) {
        let mut slot = self.attempt.lock().unwrap();
        if let Some((_socket, channel)) = slot.as_mut() {
            channel.set_revents(revents);
            channel.handle_event(receive_time);
        }
    }
}

fn self_connect(socket: &Socket) -> bool {
    match (socket.local_addr(), socket.peer_addr()) {
        (Ok(local), Ok(peer)) => local.as_socket_addr() == peer.as_socket_addr(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::event_loop_thread::EventLoopThread;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn connects_to_a_listening_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let _ = listener.accept();
        });

        let thread = EventLoopThread::new().unwrap();
        let event_loop = thread.event_loop();
        let connector = Connector::new(event_loop.clone(), InetAddress::from_socket_addr(addr));

        let (tx, rx) = mpsc::channel();
        connector.set_new_connection_callback(Box::new(move |socket| {
            let _ = tx.send(socket.peer_addr().is_ok());
        }));

        connector.start();

        let connected = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(connected);
    }

    #[test]
    fn retries_on_connection_refused() {
        // Nothing listens on this port (bind-then-drop frees the port but
        // leaves connect() refused for the test's duration on most systems).
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let thread = EventLoopThread::new().unwrap();
        let event_loop = thread.event_loop();
        let connector = Connector::new(event_loop.clone(), InetAddress::from_socket_addr(addr));
        connector.start();

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(connector.state(), State::Disconnected);
    }
}
