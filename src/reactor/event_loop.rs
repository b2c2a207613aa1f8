use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use concurrent_queue::ConcurrentQueue;
use log::{debug, error, info, warn};

use crate::epoll::Ready;
use crate::sys::EventFd;

use super::channel::Channel;
use super::poller::Poller;
use super::timer::{TimerId, TimerQueue, TimerCallback};
use super::timestamp::Timestamp;

/// Loop blocks for at most this long even with no timer pending, so it can
/// notice `quit()` and re-check its pending-task queue promptly.
const POLL_TIME_MS: i64 = 10_000;

pub type Task = Box<dyn FnOnce() + Send>;

/// Anything with a fd registered in a loop's `Poller` implements this so the
/// loop can dispatch readiness to it without knowing its concrete type
/// (`Acceptor`, `Connector`, `TcpConnection` all implement it over their own
/// `Mutex<Channel>`).
pub(crate) trait EventHost: Send + Sync {
    fn dispatch(&self, revents: Ready, receive_time: Timestamp);
}

struct WakeupHost {
    channel: Mutex<Channel>,
}

impl EventHost for WakeupHost {
    fn dispatch(&self, revents: Ready, receive_time: Timestamp) {
        Channel::dispatch(&self.channel, revents, receive_time);
    }
}

/// One thread's reactor: an epoll-backed `Poller`, a `TimerQueue`, and a
/// cross-thread task queue, matching `EventLoop.hpp`/`EventLoop.cpp`'s
/// responsibilities. Always owned behind an `Arc` so `Acceptor`, `Connector`
/// and `TcpConnection` can hold a cloneable handle back to their loop and
/// call `run_in_loop`/`queue_in_loop` from any thread.
pub struct EventLoop {
    poller: Mutex<Poller>,
    timer_queue: Mutex<TimerQueue>,
    channels: Mutex<HashMap<RawFd, Arc<dyn EventHost>>>,
    pending_tasks: ConcurrentQueue<Task>,
    wakeup_fd: EventFd,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending_tasks: AtomicBool,
    thread_id: ThreadId,
}

impl EventLoop {
    pub fn new() -> io::Result<Arc<EventLoop>> {
        let poller = Poller::new()?;
        let wakeup_fd = EventFd::new()?;
        let wakeup_raw = wakeup_fd.as_raw_fd();

        let event_loop = Arc::new(EventLoop {
            poller: Mutex::new(poller),
            timer_queue: Mutex::new(TimerQueue::new()),
            channels: Mutex::new(HashMap::new()),
            pending_tasks: ConcurrentQueue::unbounded(),
            wakeup_fd,
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            thread_id: thread::current().id(),
        });

        let mut wakeup_channel = Channel::new(wakeup_raw);
        wakeup_channel.set_read_callback(Box::new(move |_now| {
            let mut buf = [0u8; 8];
            let _ = unsafe {
                libc::read(wakeup_raw, buf.as_mut_ptr() as *mut libc::c_void, 8)
            };
        }));

        let host = Arc::new(WakeupHost { channel: Mutex::new(wakeup_channel) });
        {
            let mut poller = event_loop.poller.lock().unwrap();
            let mut channel = host.channel.lock().unwrap();
            channel.enable_reading(&mut poller);
        }
        event_loop.channels.lock().unwrap().insert(wakeup_raw, host);

        Ok(event_loop)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Panics if called from any thread but the one that owns this loop.
    /// Thread misuse is a programmer error the loop refuses to mask.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop used from thread {:?}, but it is owned by {:?}",
                thread::current().id(),
                self.thread_id
            );
        }
    }

    pub(crate) fn lock_poller(&self) -> std::sync::MutexGuard<'_, Poller> {
        self.poller.lock().unwrap()
    }

    pub(crate) fn register_channel_host(&self, fd: RawFd, host: Arc<dyn EventHost>) {
        self.channels.lock().unwrap().insert(fd, host);
    }

    pub(crate) fn unregister_channel_host(&self, fd: RawFd) {
        self.channels.lock().unwrap().remove(&fd);
    }

    /// Runs `task` immediately if called from the loop thread, otherwise
    /// hands it to `queue_in_loop`.
    pub fn run_in_loop(&self, task: Task) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending queue, waking the loop if the call
    /// came from another thread or from inside an already-running batch of
    /// pending tasks (so a task that queues another one isn't stranded
    /// until the next readiness event).
    pub fn queue_in_loop(&self, task: Task) {
        if self.pending_tasks.push(task).is_err() {
            error!("EventLoop::queue_in_loop: pending task queue closed");
            return;
        }

        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn run_at(&self, when: Timestamp, callback: TimerCallback) -> TimerId {
        let id = self.timer_queue.lock().unwrap().add_timer(callback, when, 0.0);
        self.wakeup();
        id
    }

    pub fn run_after(&self, delay_seconds: f64, callback: TimerCallback) -> TimerId {
        self.run_at(Timestamp::now().after(delay_seconds), callback)
    }

    pub fn run_every(&self, interval_seconds: f64, callback: TimerCallback) -> TimerId {
        let when = Timestamp::now().after(interval_seconds);
        let id = self.timer_queue.lock().unwrap().add_timer(callback, when, interval_seconds);
        self.wakeup();
        id
    }

    pub fn cancel(&self, id: TimerId) {
        self.timer_queue.lock().unwrap().cancel(id);
    }

    fn wakeup(&self) {
        if let Err(e) = self.wakeup_fd.write(1) {
            warn!("EventLoop::wakeup() failed: {}", e);
        }
    }

    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Pops every timer expired as of now without running it, runs the
    /// callbacks with the queue's lock released (a timer callback that
    /// schedules or cancels another timer must not deadlock against
    /// itself), then re-locks briefly to reinsert repeating timers.
    fn handle_expired_timers(&self) {
        let now = Timestamp::now();
        let expired = self.timer_queue.lock().unwrap().pop_expired(now);

        for mut timer in expired {
            timer.run();
            let now = Timestamp::now();
            self.timer_queue.lock().unwrap().reinsert_if_repeating(timer, now);
        }
    }

    /// Runs at most as many pending tasks as were queued when this call
    /// started, mirroring `doPendingFunctors`'s swap-then-run batching:
    /// a task that queues another one doesn't cause this call to spin
    /// forever, the new task just waits for the next loop iteration.
    fn do_pending_tasks(&self) {
        self.calling_pending_tasks.store(true, Ordering::Release);

        let mut remaining = self.pending_tasks.len();
        while remaining > 0 {
            match self.pending_tasks.pop() {
                Ok(task) => task(),
                Err(_) => break,
            }
            remaining -= 1;
        }

        self.calling_pending_tasks.store(false, Ordering::Release);
    }

    /// Runs the reactor loop until `quit()` is called. Must be called from
    /// the thread that constructed this `EventLoop`.
    pub fn run(self: &Arc<Self>) {
        self.assert_in_loop_thread();
        assert!(!self.looping.swap(true, Ordering::SeqCst), "EventLoop::run() called while already looping");
        self.quit.store(false, Ordering::SeqCst);

        info!("EventLoop {:?} start looping", self.thread_id);

        while !self.quit.load(Ordering::SeqCst) {
            let timeout_ms = {
                let next = self.timer_queue.lock().unwrap().next_timeout_ms();
                if next < 0 || next > POLL_TIME_MS { POLL_TIME_MS } else { next }
            };

            let poll_result = {
                let mut poller = self.poller.lock().unwrap();
                poller.poll(timeout_ms)
            };

            let (now, active) = match poll_result {
                Ok(r) => r,
                Err(e) => {
                    error!("EventLoop: poll error: {}", e);
                    continue;
                }
            };

            if !active.is_empty() {
                // Collect hosts and release the registry lock before
                // dispatching: a callback (e.g. Acceptor accepting a new
                // connection) may register or remove channels of its own,
                // which would deadlock against a lock held for the whole
                // dispatch loop.
                let to_dispatch: Vec<(Ready, Arc<dyn EventHost>)> = {
                    let channels = self.channels.lock().unwrap();
                    active
                        .iter()
                        .filter_map(|(token, revents)| {
                            let fd = token.0 as RawFd;
                            match channels.get(&fd) {
                                Some(host) => Some((*revents, host.clone())),
                                None => {
                                    debug!("EventLoop: readiness for untracked fd {}", fd);
                                    None
                                }
                            }
                        })
                        .collect()
                };

                for (revents, host) in to_dispatch {
                    host.dispatch(revents, now);
                }
            }

            self.handle_expired_timers();
            self.do_pending_tasks();
        }

        info!("EventLoop {:?} stop looping", self.thread_id);
        self.looping.store(false, Ordering::SeqCst);
    }
}
