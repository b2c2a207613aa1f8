use std::fmt;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, warn};

use crate::epoll::Ready;

use super::buffer::Buffer;
use super::channel::Channel;
use super::event_loop::{EventLoop, EventHost};
use super::inet_address::InetAddress;
use super::socket::Socket;
use super::timestamp::Timestamp;

/// Connections stop buffering writes and invoke the high-water-mark
/// callback once queued output crosses this many bytes.
pub const DEFAULT_HIGH_WATER_MARK: usize = 10 * 1024 * 1024;

pub type TcpConnectionRef = Arc<TcpConnection>;

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionRef, &mut Buffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionRef, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

pub(crate) fn default_connection_callback() -> ConnectionCallback {
    Arc::new(|conn: &TcpConnectionRef| {
        debug!(
            "{} -> {} is {}",
            conn.local_addr(),
            conn.peer_addr(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
    })
}

pub(crate) fn default_message_callback() -> MessageCallback {
    Arc::new(|_conn: &TcpConnectionRef, buf: &mut Buffer, _receive_time: Timestamp| {
        buf.retrieve_all();
    })
}

/// One accepted or connected TCP socket plus its buffers, callbacks and
/// lifecycle state. Grounded on `TcpConnection.hpp`/`TcpConnection.cpp`.
///
/// Always held behind an `Arc` (`TcpConnectionRef`) since callbacks and
/// `send()`/`shutdown()`/`force_close()` must be callable from any thread,
/// not just the owning loop's. Every field that mutates does so behind a
/// `Mutex` or atomic so the type is `Send + Sync` without unsafe code; in
/// practice only the owning loop thread ever touches `channel`/`input_buf`,
/// so these locks are uncontended on the hot path.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    socket: Socket,
    channel: Mutex<Channel>,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    state: AtomicU8,
    input_buf: Mutex<Buffer>,
    output_buf: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    reading: AtomicBool,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> Arc<TcpConnection> {
        let fd = socket.as_raw_fd();

        Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let w_read = weak.clone();
            let w_write = weak.clone();
            let w_close = weak.clone();
            let w_error = weak.clone();

            let mut channel = Channel::new(fd);
            channel.set_read_callback(Box::new(move |now| {
                if let Some(conn) = w_read.upgrade() {
                    conn.handle_read(now);
                }
            }));
            channel.set_write_callback(Box::new(move || {
                if let Some(conn) = w_write.upgrade() {
                    conn.handle_write();
                }
            }));
            channel.set_close_callback(Box::new(move || {
                if let Some(conn) = w_close.upgrade() {
                    conn.handle_close();
                }
            }));
            channel.set_error_callback(Box::new(move || {
                if let Some(conn) = w_error.upgrade() {
                    conn.handle_error();
                }
            }));

            debug!("TcpConnection::new [{}] fd={}", name, fd);

            TcpConnection {
                event_loop,
                name,
                socket,
                channel: Mutex::new(channel),
                local_addr,
                peer_addr,
                state: AtomicU8::new(State::Connecting as u8),
                input_buf: Mutex::new(Buffer::new()),
                output_buf: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                reading: AtomicBool::new(false),
                connection_callback: Mutex::new(default_connection_callback()),
                message_callback: Mutex::new(default_message_callback()),
                write_complete_callback: Mutex::new(None),
                high_water_mark_callback: Mutex::new(None),
                close_callback: Mutex::new(None),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddress {
        self.local_addr.clone()
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.peer_addr.clone()
    }

    pub fn connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == State::Connected as u8
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::SeqCst) {
            0 => State::Disconnected,
            1 => State::Connecting,
            2 => State::Connected,
            _ => State::Disconnecting,
        }
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = self.socket.set_tcp_nodelay(on) {
            warn!("TcpConnection[{}]: set_tcp_no_delay failed: {}", self.name, e);
        }
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.lock().unwrap() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_mark_callback.lock().unwrap() = Some(cb);
        self.high_water_mark.store(mark, Ordering::SeqCst);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_callback.lock().unwrap() = Some(cb);
    }

    /// Queues `data` for sending, running the direct-write fast path if
    /// called from the loop thread or routing through `run_in_loop`
    /// otherwise. A no-op once the connection isn't `Connected`.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }

        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let this = self.clone();
            let owned = data.to_vec();
            self.event_loop.run_in_loop(Box::new(move || this.send_in_loop(&owned)));
        }
    }

    /// Tries a direct, non-blocking `write(2)` when the channel is idle;
    /// anything not written (or the whole payload, if the channel is
    /// already draining a backlog) goes to the output buffer, enabling
    /// writability and firing the high-water-mark callback if the backlog
    /// just crossed the configured mark.
    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();

        if self.state() == State::Disconnected {
            warn!("TcpConnection[{}]: disconnected, give up writing", self.name);
            return;
        }

        let mut wrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        let channel_idle_and_buf_empty = {
            let channel = self.channel.lock().unwrap();
            !channel.is_writing() && self.output_buf.lock().unwrap().readable_bytes() == 0
        };

        if channel_idle_and_buf_empty {
            match self.socket.write(data) {
                Ok(n) => {
                    wrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
                            let this = self.clone();
                            self.event_loop.queue_in_loop(Box::new(move || cb(&this)));
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        error!("TcpConnection[{}]: send_in_loop write failed: {}", self.name, e);
                        if e.raw_os_error() == Some(libc::EPIPE) || e.raw_os_error() == Some(libc::ECONNRESET) {
                            fault = true;
                        }
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let mut output = self.output_buf.lock().unwrap();
            let old_len = output.readable_bytes();

            if old_len + remaining >= self.high_water_mark.load(Ordering::SeqCst) {
                if let Some(cb) = self.high_water_mark_callback.lock().unwrap().clone() {
                    let this = self.clone();
                    let total = old_len + remaining;
                    self.event_loop.queue_in_loop(Box::new(move || cb(&this, total)));
                }
            }

            output.append(&data[wrote..]);
            drop(output);

            let mut channel = self.channel.lock().unwrap();
            if !channel.is_writing() {
                let mut poller = self.event_loop.lock_poller();
                channel.enable_writing(&mut poller);
            }
        }
    }

    /// Half-closes the write side once any buffered output has drained.
    /// A no-op unless currently `Connected`.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state.compare_exchange(
            State::Connected as u8,
            State::Disconnecting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ).is_err() {
            return;
        }

        let this = self.clone();
        self.event_loop.run_in_loop(Box::new(move || this.shutdown_in_loop()));
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        let channel = self.channel.lock().unwrap();
        if !channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                warn!("TcpConnection[{}]: shutdown_write failed: {}", self.name, e);
            }
        }
    }

    /// Closes the connection immediately regardless of buffered output,
    /// running the normal close path (`handle_close`) rather than just
    /// dropping the socket, so callbacks still fire and teardown stays
    /// uniform.
    pub fn force_close(self: &Arc<Self>) {
        let this = self.clone();
        self.event_loop.run_in_loop(Box::new(move || this.force_close_in_loop()));
    }

    fn force_close_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.handle_close();
        }
    }

    /// Called once by the owner (`TcpServer`/`TcpClient`) right after
    /// registering this connection's channel, matching
    /// `connectEstablished()`.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        self.state.store(State::Connected as u8, Ordering::SeqCst);
        self.reading.store(true, Ordering::SeqCst);

        let fd = self.socket.as_raw_fd();
        let host: Arc<dyn EventHost> = self.clone();
        self.event_loop.register_channel_host(fd, host);

        {
            let mut poller = self.event_loop.lock_poller();
            let mut channel = self.channel.lock().unwrap();
            channel.enable_reading(&mut poller);
        }

        let cb = self.connection_callback.lock().unwrap().clone();
        cb(self);
    }

    /// Called once by the owner as the very last step of teardown,
    /// matching `connectDestroyed()`.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();

        if self.state.swap(State::Disconnected as u8, Ordering::SeqCst) == State::Connected as u8 {
            let mut poller = self.event_loop.lock_poller();
            let mut channel = self.channel.lock().unwrap();
            // handle_close_in_loop may have already disabled this channel;
            // disabling an already-empty interest set fails epoll's
            // add-with-no-interest check before the DEL it also issues.
            if !channel.is_none_event() {
                channel.disable_all(&mut poller);
            }
            drop(channel);
            drop(poller);

            let cb = self.connection_callback.lock().unwrap().clone();
            cb(self);
        }

        let fd = self.socket.as_raw_fd();
        {
            let mut poller = self.event_loop.lock_poller();
            let mut channel = self.channel.lock().unwrap();
            channel.remove(&mut poller);
        }
        self.event_loop.unregister_channel_host(fd);
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        self.event_loop.assert_in_loop_thread();

        let mut input = self.input_buf.lock().unwrap();
        match input.read_fd(self.socket.as_raw_fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                let cb = self.message_callback.lock().unwrap().clone();
                cb(self, &mut input, receive_time);
            }
            Err(e) => {
                drop(input);
                error!("TcpConnection[{}]: handle_read failed: {}", self.name, e);
                self.handle_error();
            }
        }
    }

    /// Only queues the real work: this runs as the write callback taken out
    /// of `channel` by `Channel::dispatch`, so `channel` isn't borrowed here,
    /// but deferring via `queue_in_loop` still keeps write completion
    /// ordered after whatever else this pending-task batch has queued.
    fn handle_write(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        let this = self.clone();
        self.event_loop.queue_in_loop(Box::new(move || this.handle_write_in_loop()));
    }

    fn handle_write_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();

        let is_writing = self.channel.lock().unwrap().is_writing();
        if !is_writing {
            debug!("TcpConnection[{}]: fd={} is down, no more writing", self.name, self.socket.as_raw_fd());
            return;
        }

        let mut output = self.output_buf.lock().unwrap();
        match self.socket.write(output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);

                    let mut poller = self.event_loop.lock_poller();
                    let mut channel = self.channel.lock().unwrap();
                    channel.disable_writing(&mut poller);
                    drop(channel);
                    drop(poller);

                    if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
                        let this = self.clone();
                        self.event_loop.queue_in_loop(Box::new(move || cb(&this)));
                    }

                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                } else {
                    debug!("TcpConnection[{}]: more data to write", self.name);
                }
            }
            Err(e) => error!("TcpConnection[{}]: handle_write failed: {}", self.name, e),
        }
    }

    /// Like `handle_write`, this may run as the close callback taken out of
    /// `channel` by `Channel::dispatch` (its hangup branch), or directly
    /// from `handle_read` on EOF; it only queues `handle_close_in_loop`
    /// rather than touching the channel itself, since the fd is still
    /// registered and readable/writable state still matters until then.
    fn handle_close(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            return;
        }
        let this = self.clone();
        self.event_loop.queue_in_loop(Box::new(move || this.handle_close_in_loop()));
    }

    fn handle_close_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            return;
        }
        debug!("TcpConnection[{}]: handle_close, state={:?}", self.name, self.state());

        {
            let mut poller = self.event_loop.lock_poller();
            let mut channel = self.channel.lock().unwrap();
            channel.disable_all(&mut poller);
        }

        if let Some(cb) = self.close_callback.lock().unwrap().clone() {
            cb(self);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!("TcpConnection[{}]: SO_ERROR = {}", self.name, e),
            Ok(None) => error!("TcpConnection[{}]: handle_error with no SO_ERROR set", self.name),
            Err(e) => error!("TcpConnection[{}]: take_error() failed: {}", self.name, e),
        }
    }
}

impl EventHost for TcpConnection {
    fn dispatch(&self, revents: Ready, receive_time: Timestamp) {
        // `Channel::dispatch` releases `channel`'s lock before running the
        // selected callback: `handle_read` calls the user's message
        // callback synchronously, and that callback routinely calls back
        // into `send()`/`shutdown()` on this same connection, which need to
        // lock `channel` themselves. Holding the lock across the call
        // would deadlock that re-entry.
        Channel::dispatch(&self.channel, revents, receive_time);
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::event_loop_thread::EventLoopThread;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// A connected pair of plain blocking sockets, one of which the test
    /// hands off to a `TcpConnection` (after switching it to nonblocking);
    /// the other stays in the test thread's hands for driving/observing it.
    fn socket_pair() -> (Socket, Socket) {
        let (a, b) = crate::sys::Socket::new_pair(libc::AF_UNIX, libc::SOCK_STREAM).unwrap();
        (Socket::from_raw(a), Socket::from_raw(b))
    }

    #[test]
    fn echoes_received_bytes_back() {
        let thread = EventLoopThread::new().unwrap();
        let event_loop = thread.event_loop();

        let (server_side, peer_side) = socket_pair();
        server_side.set_nonblocking(true).unwrap();

        let dummy_addr = InetAddress::new(0, true, false);
        let event_loop2 = event_loop.clone();
        event_loop.run_in_loop(Box::new(move || {
            let conn = TcpConnection::new(
                event_loop2.clone(),
                "echo-test".to_string(),
                server_side,
                dummy_addr,
                dummy_addr,
            );
            conn.set_message_callback(Arc::new(|conn: &TcpConnectionRef, buf: &mut Buffer, _now| {
                let data = buf.retrieve_all_as_vec();
                conn.send(&data);
            }));
            conn.connect_established();
        }));

        std::thread::sleep(Duration::from_millis(50));
        peer_side.write(b"ping").unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let mut buf = [0u8; 4];
        let n = peer_side.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn invokes_high_water_mark_callback_once_threshold_crossed() {
        let thread = EventLoopThread::new().unwrap();
        let event_loop = thread.event_loop();

        let (server_side, _peer_side) = socket_pair();
        server_side.set_nonblocking(true).unwrap();

        let dummy_addr = InetAddress::new(0, true, false);
        let hit = Arc::new(AtomicBool::new(false));
        let hit2 = hit.clone();

        let event_loop2 = event_loop.clone();
        event_loop.run_in_loop(Box::new(move || {
            let conn = TcpConnection::new(
                event_loop2.clone(),
                "hwm-test".to_string(),
                server_side,
                dummy_addr,
                dummy_addr,
            );
            conn.set_high_water_mark_callback(
                Arc::new(move |_conn: &TcpConnectionRef, _len: usize| {
                    hit2.store(true, Ordering::SeqCst);
                }),
                1024,
            );
            conn.connect_established();
            // larger than the pair's kernel send buffer, so the remainder
            // after the first partial direct write lands in the output
            // buffer and crosses the 1 KiB mark set above
            conn.send(&vec![b'x'; 1_000_000]);
        }));

        std::thread::sleep(Duration::from_millis(200));
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_half_closes_once_idle() {
        let thread = EventLoopThread::new().unwrap();
        let event_loop = thread.event_loop();

        let (server_side, peer_side) = socket_pair();
        server_side.set_nonblocking(true).unwrap();

        let dummy_addr = InetAddress::new(0, true, false);
        let event_loop2 = event_loop.clone();
        event_loop.run_in_loop(Box::new(move || {
            let conn = TcpConnection::new(
                event_loop2.clone(),
                "shutdown-test".to_string(),
                server_side,
                dummy_addr,
                dummy_addr,
            );
            conn.connect_established();
            conn.shutdown();
        }));

        std::thread::sleep(Duration::from_millis(100));

        let mut buf = [0u8; 1];
        let n = peer_side.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn force_close_disables_channel_and_invokes_close_callback() {
        let thread = EventLoopThread::new().unwrap();
        let event_loop = thread.event_loop();

        let (server_side, _peer_side) = socket_pair();
        server_side.set_nonblocking(true).unwrap();

        let dummy_addr = InetAddress::new(0, true, false);
        let closed = Arc::new(AtomicBool::new(false));
        let closed2 = closed.clone();

        let event_loop2 = event_loop.clone();
        event_loop.run_in_loop(Box::new(move || {
            let conn = TcpConnection::new(
                event_loop2.clone(),
                "force-close-test".to_string(),
                server_side,
                dummy_addr,
                dummy_addr,
            );
            conn.set_close_callback(Arc::new(move |_conn: &TcpConnectionRef| {
                closed2.store(true, Ordering::SeqCst);
            }));
            conn.connect_established();
            conn.force_close();
        }));

        std::thread::sleep(Duration::from_millis(100));
        assert!(closed.load(Ordering::SeqCst));
    }
}
