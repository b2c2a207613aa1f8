use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use log::{info, warn};

use super::acceptor::Acceptor;
use super::event_loop::EventLoop;
use super::event_loop_thread::EventLoopThreadPool;
use super::inet_address::InetAddress;
use super::socket::Socket;
use super::tcp_connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionRef,
    WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};

/// Binds an `Acceptor` on a base loop to a pool of I/O loops, round-robining
/// every accepted connection onto one of them. Grounded on
/// `TcpServer.hpp`/`TcpServer.cpp`.
///
/// The connection table (`name -> TcpConnectionRef`) is mutated only on the
/// base loop; an `IndexMap` keeps iteration order deterministic (insertion
/// order) for whatever connections remain when `TcpServer` is dropped.
pub struct TcpServer {
    base_loop: Arc<EventLoop>,
    name: String,
    listen_addr: InetAddress,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
    reuse_port: bool,
    thread_pool: Mutex<EventLoopThreadPool>,
    started: AtomicBool,
    next_conn_id: AtomicUsize,
    connections: Mutex<IndexMap<String, TcpConnectionRef>>,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    high_water_mark: AtomicUsize,
}

impl TcpServer {
    pub fn new(base_loop: Arc<EventLoop>, listen_addr: InetAddress, name: String, reuse_port: bool) -> Arc<TcpServer> {
        let thread_pool = EventLoopThreadPool::new(base_loop.clone());

        Arc::new(TcpServer {
            base_loop,
            name,
            listen_addr,
            acceptor: Mutex::new(None),
            reuse_port,
            thread_pool: Mutex::new(thread_pool),
            started: AtomicBool::new(false),
            next_conn_id: AtomicUsize::new(1),
            connections: Mutex::new(IndexMap::new()),
            connection_callback: Mutex::new(super::tcp_connection::default_connection_callback()),
            message_callback: Mutex::new(super::tcp_connection::default_message_callback()),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listen_addr(&self) -> &InetAddress {
        &self.listen_addr
    }

    /// Must be called before `start()`. Panics if called after the server
    /// has started.
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started.load(Ordering::SeqCst), "TcpServer::set_thread_num() called after start()");
        self.thread_pool.lock().unwrap().start(num_threads).expect("failed to start event loop thread pool");
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

    pub fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Idempotent: starts the thread pool (if `set_thread_num` hadn't
    /// already) and posts `Acceptor::listen` to the base loop. Safe to call
    /// from any thread.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // `set_thread_num` may not have been called at all; start the pool
        // with zero threads in that case so every connection lands on the
        // base loop.
        {
            let mut pool = self.thread_pool.lock().unwrap();
            if !pool.is_started() {
                let _ = pool.start(0);
            }
        }

        let acceptor = Acceptor::new(self.base_loop.clone(), &self.listen_addr, self.reuse_port)?;

        let this = self.clone();
        acceptor.set_new_connection_callback(Box::new(move |socket, peer_addr| {
            this.new_connection(socket, peer_addr);
        }));

        *self.acceptor.lock().unwrap() = Some(acceptor.clone());

        self.base_loop.run_in_loop(Box::new(move || {
            acceptor.listen().unwrap_or_else(|e| warn!("TcpServer: acceptor listen() failed: {}", e));
        }));

        Ok(())
    }

    /// Runs on the base loop (called directly from the `Acceptor`'s read
    /// callback, which always fires there): picks the next I/O loop,
    /// constructs the connection, stores it, and hands it off.
    fn new_connection(self: &Arc<Self>, socket: Socket, peer_addr: InetAddress) {
        self.base_loop.assert_in_loop_thread();

        let io_loop = self.thread_pool.lock().unwrap().get_next_loop();

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}-{}#{}", self.name, peer_addr.to_ip_port(), conn_id);

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("TcpServer: failed to read local_addr for new connection: {}", e);
                return;
            }
        };

        info!("TcpServer::new_connection [{}] - new connection [{}] from {}", self.name, conn_name, peer_addr);

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);
        conn.set_connection_callback(self.connection_callback.lock().unwrap().clone());
        conn.set_message_callback(self.message_callback.lock().unwrap().clone());
        if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        if let Some(cb) = self.high_water_mark_callback.lock().unwrap().clone() {
            conn.set_high_water_mark_callback(cb, self.high_water_mark.load(Ordering::SeqCst));
        }

        let this = self.clone();
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionRef| {
            this.remove_connection(conn);
        }));

        self.connections.lock().unwrap().insert(conn_name, conn.clone());

        io_loop.run_in_loop(Box::new(move || conn.connect_established()));
    }

    /// Called from a connection's close callback, which always runs on
    /// that connection's owning I/O loop, so this hops back to the base
    /// loop before touching the shared connection map.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionRef) {
        let this = self.clone();
        let conn = conn.clone();
        self.base_loop.run_in_loop(Box::new(move || this.remove_connection_in_loop(&conn)));
    }

    fn remove_connection_in_loop(self: &Arc<Self>, conn: &TcpConnectionRef) {
        self.base_loop.assert_in_loop_thread();
        info!("TcpServer::remove_connection_in_loop [{}] - connection {}", self.name, conn.name());

        self.connections.lock().unwrap().shift_remove(conn.name());

        let conn = conn.clone();
        let io_loop = conn.event_loop().clone();
        io_loop.queue_in_loop(Box::new(move || conn.connect_destroyed()));
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections = self.connections.lock().unwrap();
        if !connections.is_empty() {
            warn!(
                "TcpServer [{}] dropped with {} connection(s) still open",
                self.name,
                connections.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::buffer::Buffer;
    use super::super::timestamp::Timestamp;
    use std::sync::atomic::AtomicUsize as AU;
    use std::time::Duration;

    #[test]
    fn echoes_and_signals_connection_lifecycle() {
        let base_loop = EventLoop::new().unwrap();
        let listen_addr = InetAddress::new(0, true, false);
        let server = TcpServer::new(base_loop.clone(), listen_addr, "echo".to_string(), false);

        let up_down = Arc::new((AU::new(0), AU::new(0)));
        let ud2 = up_down.clone();
        server.set_connection_callback(Arc::new(move |conn: &TcpConnectionRef| {
            if conn.connected() {
                ud2.0.fetch_add(1, Ordering::SeqCst);
            } else {
                ud2.1.fetch_add(1, Ordering::SeqCst);
            }
        }));
        server.set_message_callback(Arc::new(|conn: &TcpConnectionRef, buf: &mut Buffer, _now: Timestamp| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
        }));
        server.set_thread_num(2);

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let server2 = server.clone();
        base_loop.run_in_loop(Box::new(move || {
            server2.start().unwrap();
            started_tx.send(()).unwrap();
        }));

        let thread = std::thread::spawn(move || {
            base_loop.run();
        });

        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        // server bound to port 0, so discover the real bound port via the
        // acceptor rather than the (port-0) configured listen_addr.
        let real_addr = {
            let acceptor = server.acceptor.lock().unwrap();
            acceptor.as_ref().unwrap().local_addr().unwrap()
        };

        let mut client = std::net::TcpStream::connect(real_addr.as_socket_addr()).unwrap();
        use std::io::{Read, Write};
        client.write_all(b"hello\r\n").unwrap();

        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello\r\n");

        drop(client);
        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(up_down.0.load(Ordering::SeqCst), 1);
        assert_eq!(up_down.1.load(Ordering::SeqCst), 1);

        server.base_loop.quit();
        let _ = thread.join();
    }
}
