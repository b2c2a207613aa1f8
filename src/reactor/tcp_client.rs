use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use super::connector::Connector;
use super::event_loop::EventLoop;
use super::inet_address::InetAddress;
use super::socket::Socket;
use super::tcp_connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionRef, WriteCompleteCallback,
};

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// Owns a `Connector` plus at most one live `TcpConnection`. Grounded on
/// `TcpClient.hpp`/`TcpClient.cpp`.
///
/// `connection()` may be called from any thread, so the current connection
/// is held behind its own `Mutex` rather than relying on the owning loop's
/// thread affinity (unlike `TcpServer`'s connection map, which only the
/// base loop ever touches).
pub struct TcpClient {
    event_loop: Arc<EventLoop>,
    server_addr: InetAddress,
    name: String,
    connector: Arc<Connector>,
    retry: AtomicBool,
    connect: AtomicBool,
    connection: Mutex<Option<TcpConnectionRef>>,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
}

impl TcpClient {
    pub fn new(event_loop: Arc<EventLoop>, server_addr: InetAddress, name: String) -> Arc<TcpClient> {
        let connector = Connector::new(event_loop.clone(), server_addr);

        let client = Arc::new(TcpClient {
            event_loop,
            server_addr,
            name,
            connector,
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            connection: Mutex::new(None),
            connection_callback: Mutex::new(super::tcp_connection::default_connection_callback()),
            message_callback: Mutex::new(super::tcp_connection::default_message_callback()),
            write_complete_callback: Mutex::new(None),
        });

        let this = client.clone();
        client.connector.set_new_connection_callback(Box::new(move |socket| {
            this.new_connection(socket);
        }));

        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> &InetAddress {
        &self.server_addr
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

    /// Reconnects automatically (via `Connector::restart`) whenever the
    /// current connection closes. Off by default.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::SeqCst);
    }

    pub fn connection(&self) -> Option<TcpConnectionRef> {
        self.connection.lock().unwrap().clone()
    }

    /// Starts the connector. Safe to call from any thread.
    pub fn connect(self: &Arc<Self>) {
        info!("TcpClient::connect [{}] - connecting to {}", self.name, self.server_addr);
        self.connect.store(true, Ordering::SeqCst);
        self.connector.start();
    }

    /// Half-closes the current connection, if any.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::SeqCst);
        if let Some(conn) = self.connection() {
            conn.shutdown();
        }
    }

    /// Cancels any in-flight connect attempt. Does not touch an already
    /// established connection.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::SeqCst);
        self.connector.stop();
    }

    /// Runs on the connector's loop once a connect attempt succeeds;
    /// constructs the `TcpConnection`, wires callbacks, and establishes it.
    fn new_connection(self: &Arc<Self>, socket: Socket) {
        self.event_loop.assert_in_loop_thread();

        let peer_addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(_) => self.server_addr,
        };
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(_) => InetAddress::new(0, true, false),
        };

        let conn_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, conn_id);

        let conn = TcpConnection::new(self.event_loop.clone(), conn_name, socket, local_addr, peer_addr);
        conn.set_connection_callback(self.connection_callback.lock().unwrap().clone());
        conn.set_message_callback(self.message_callback.lock().unwrap().clone());
        if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }

        let this = self.clone();
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionRef| {
            this.remove_connection(conn);
        }));

        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    /// Called from the connection's close callback on the owning loop.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionRef) {
        self.event_loop.assert_in_loop_thread();

        {
            let mut current = self.connection.lock().unwrap();
            if current.as_ref().map(|c| Arc::ptr_eq(c, conn)).unwrap_or(false) {
                current.take();
            }
        }

        let conn = conn.clone();
        self.event_loop.queue_in_loop(Box::new(move || conn.connect_destroyed()));

        if self.retry.load(Ordering::SeqCst) && self.connect.load(Ordering::SeqCst) {
            info!("TcpClient::remove_connection [{}] - reconnecting to {}", self.name, self.server_addr);
            self.connector.restart();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::event_loop_thread::EventLoopThread;
    use std::sync::atomic::AtomicUsize as AU;
    use std::time::Duration;

    #[test]
    fn connects_and_reports_connection_up() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                if stream.is_err() {
                    break;
                }
                // keep the accepted stream alive for the test's duration
                std::thread::sleep(Duration::from_secs(2));
            }
        });

        let thread = EventLoopThread::new().unwrap();
        let event_loop = thread.event_loop();
        let client = TcpClient::new(event_loop, InetAddress::from_socket_addr(addr), "test-client".to_string());

        let up = Arc::new(AU::new(0));
        let up2 = up.clone();
        client.set_connection_callback(Arc::new(move |conn: &TcpConnectionRef| {
            if conn.connected() {
                up2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        client.connect();

        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(up.load(Ordering::SeqCst), 1);
        assert!(client.connection().is_some());
    }

    #[test]
    fn disconnect_half_closes_current_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = std::thread::spawn(move || listener.accept().unwrap().0);

        let thread = EventLoopThread::new().unwrap();
        let event_loop = thread.event_loop();
        let client = TcpClient::new(event_loop, InetAddress::from_socket_addr(addr), "test-client".to_string());
        client.connect();

        std::thread::sleep(Duration::from_millis(300));
        client.disconnect();

        let mut peer = accepted.join().unwrap();
        std::thread::sleep(Duration::from_millis(200));

        use std::io::Read;
        let mut buf = [0u8; 1];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    }
}
