use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::event_loop::EventLoop;

/// Spawns one OS thread that owns exactly one `EventLoop` for its entire
/// lifetime and blocks in `EventLoop::run()`. `event_loop()` hands the
/// spawning thread a cloneable `Arc<EventLoop>` once the new thread's loop
/// has finished constructing itself, via an `mpsc` handoff so the caller
/// never observes a half-constructed loop.
pub struct EventLoopThread {
    event_loop: Arc<EventLoop>,
    join_handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new() -> io::Result<EventLoopThread> {
        let (tx, rx) = mpsc::channel::<io::Result<Arc<EventLoop>>>();

        let join_handle = thread::Builder::new()
            .name("event-loop".to_string())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };

                let handle = event_loop.clone();
                if tx.send(Ok(event_loop)).is_err() {
                    return;
                }

                handle.run();
            })
            .expect("failed to spawn event loop thread");

        let event_loop = rx
            .recv()
            .expect("event loop thread exited before handing back its loop")?;

        Ok(EventLoopThread { event_loop, join_handle: Some(join_handle) })
    }

    pub fn event_loop(&self) -> Arc<EventLoop> {
        self.event_loop.clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Round-robins new connections across a fixed-size pool of
/// `EventLoopThread`s, matching `EventLoopThreadPool::getNextLoop`. An empty
/// pool (`num_threads == 0`, the default) means every connection runs on
/// the server's own base loop.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    threads: Vec<EventLoopThread>,
    next: std::sync::atomic::AtomicUsize,
    started: bool,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            threads: Vec::new(),
            next: std::sync::atomic::AtomicUsize::new(0),
            started: false,
        }
    }

    /// Must be called before `get_next_loop`, exactly once, from the base
    /// loop's thread.
    pub fn start(&mut self, num_threads: usize) -> io::Result<()> {
        assert!(!self.started, "EventLoopThreadPool::start() called twice");
        self.started = true;

        for _ in 0..num_threads {
            self.threads.push(EventLoopThread::new()?);
        }

        Ok(())
    }

    /// Returns the next loop in round-robin order, or the base loop if the
    /// pool has no worker threads.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        if self.threads.is_empty() {
            return self.base_loop.clone();
        }

        let index = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.threads.len();
        self.threads[index].event_loop()
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn thread_owns_and_runs_its_loop() {
        let thread = EventLoopThread::new().unwrap();
        let event_loop = thread.event_loop();

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        event_loop.run_in_loop(Box::new(move || ran2.store(true, Ordering::SeqCst)));

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn pool_round_robins_across_threads() {
        let base = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(base.clone());
        pool.start(2).unwrap();

        let first = pool.get_next_loop();
        let second = pool.get_next_loop();
        let third = pool.get_next_loop();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn empty_pool_returns_base_loop() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(base.clone());

        assert!(Arc::ptr_eq(&pool.get_next_loop(), &base));
    }
}
