use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{error, info, warn};

use crate::epoll::Ready;

use super::channel::Channel;
use super::event_loop::{EventLoop, EventHost};
use super::inet_address::InetAddress;
use super::socket::Socket;
use super::timestamp::Timestamp;

pub type NewConnectionCallback = Box<dyn Fn(Socket, InetAddress) + Send + Sync>;

/// Owns the listening socket for one `TcpServer`. Grounded on
/// `Acceptor.hpp`/`Acceptor.cpp`: `SO_REUSEADDR` always set, `SO_REUSEPORT`
/// optional, and the "idle fd" trick to keep accepting past `EMFILE` so the
/// server doesn't busy-loop on a readable listening socket it can't drain.
///
/// Kept alive by the `Arc<dyn EventHost>` clone registered in its
/// `EventLoop` once `listen()` runs; callers that want it torn down before
/// the loop itself goes away must call `stop_listening()` explicitly.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    socket: Socket,
    channel: Mutex<Channel>,
    listening: AtomicBool,
    idle_fd: Mutex<Option<File>>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(event_loop: Arc<EventLoop>, listen_addr: &InetAddress, reuse_port: bool) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new_stream(&listen_addr.as_socket_addr())?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind_address(listen_addr)?;

        let idle_fd = File::open("/dev/null")?;
        let fd = socket.as_raw_fd();

        let acceptor = Arc::new_cyclic(|weak: &Weak<Acceptor>| {
            let weak = weak.clone();
            let mut channel = Channel::new(fd);
            channel.set_read_callback(Box::new(move |_now| {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.handle_read();
                }
            }));

            Acceptor {
                event_loop,
                socket,
                channel: Mutex::new(channel),
                listening: AtomicBool::new(false),
                idle_fd: Mutex::new(Some(idle_fd)),
                new_connection_callback: Mutex::new(None),
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_callback.lock().unwrap() = Some(cb);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> io::Result<InetAddress> {
        self.socket.local_addr()
    }

    /// Registers the listening fd for readiness and starts listening.
    /// Idempotent: calling it again is a no-op.
    pub fn listen(self: &Arc<Self>) -> io::Result<()> {
        self.event_loop.assert_in_loop_thread();

        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.socket.listen()?;

        let fd = self.socket.as_raw_fd();
        let host: Arc<dyn EventHost> = self.clone();
        self.event_loop.register_channel_host(fd, host);

        let mut poller = self.event_loop.lock_poller();
        let mut channel = self.channel.lock().unwrap();
        channel.enable_reading(&mut poller);

        Ok(())
    }

    /// Deregisters the listening fd, dropping the loop's `Arc` on this
    /// acceptor. Must be called (from the loop thread) before the owner's
    /// last reference to this `Acceptor` goes away, or `Channel::drop`'s
    /// invariant check will fire.
    pub fn stop_listening(&self) {
        self.event_loop.assert_in_loop_thread();

        if !self.listening.swap(false, Ordering::SeqCst) {
            return;
        }

        let fd = self.socket.as_raw_fd();
        let mut poller = self.event_loop.lock_poller();
        let mut channel = self.channel.lock().unwrap();
        channel.disable_all(&mut poller);
        channel.remove(&mut poller);
        drop(channel);
        drop(poller);

        self.event_loop.unregister_channel_host(fd);
    }

    /// Accepts every pending connection, handing each to the registered
    /// callback (or closing it immediately if none is set), until the
    /// listening socket would block. On `EMFILE`, frees the idle-fd reserve
    /// to accept and immediately drop one connection, then reopens the
    /// reserve, keeping the listening fd from spinning readable forever when
    /// the process is out of descriptors.
    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();

        loop {
            match self.socket.accept() {
                Ok((conn_socket, peer_addr)) => {
                    let callback = self.new_connection_callback.lock().unwrap();
                    match callback.as_ref() {
                        Some(cb) => cb(conn_socket, peer_addr),
                        None => info!("Acceptor: no connection callback set, dropping connection from {}", peer_addr),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    if e.raw_os_error() == Some(libc::EMFILE) {
                        warn!("Acceptor: EMFILE, freeing idle fd reserve to drain one pending connection");
                        let mut idle = self.idle_fd.lock().unwrap();
                        if idle.take().is_some() {
                            let _ = self.socket.accept(); // accepted then dropped: no fd budget to keep it
                            *idle = File::open("/dev/null").ok();
                        }
                    } else {
                        error!("Acceptor::handle_read accept() failed: {}", e);
                    }
                    break;
                }
            }
        }
    }
}

impl EventHost for Acceptor {
    fn dispatch(&self, revents: Ready, receive_time: Timestamp) {
        Channel::dispatch(&self.channel, revents, receive_time);
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.listening.load(Ordering::SeqCst) {
            warn!(
                "Acceptor for fd {} dropped while still listening; call stop_listening() first",
                self.socket.as_raw_fd()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::event_loop_thread::EventLoopThread;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn accepts_connections_and_invokes_callback() {
        let thread = EventLoopThread::new().unwrap();
        let event_loop = thread.event_loop();

        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted2 = accepted.clone();
        let (addr_tx, addr_rx) = mpsc::channel();

        let event_loop2 = event_loop.clone();
        event_loop.run_in_loop(Box::new(move || {
            let listen_addr = InetAddress::new(0, true, false);
            let acceptor = Acceptor::new(event_loop2, &listen_addr, false).unwrap();
            acceptor.set_new_connection_callback(Box::new(move |_socket, _peer| {
                accepted2.fetch_add(1, Ordering::SeqCst);
            }));
            acceptor.listen().unwrap();
            addr_tx.send(acceptor.local_addr().unwrap()).unwrap();
        }));

        let bound = addr_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let _client = std::net::TcpStream::connect(bound.as_socket_addr()).unwrap();

        std::thread::sleep(Duration::from_millis(200));
        assert!(accepted.load(Ordering::SeqCst) >= 1);
    }
}
