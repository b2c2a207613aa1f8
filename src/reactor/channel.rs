use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::epoll::{Ready, Token};

use super::poller::Poller;
use super::timestamp::Timestamp;

pub type EventCallback = Box<dyn FnMut() + Send>;
pub type ReadEventCallback = Box<dyn FnMut(Timestamp) + Send>;

/// Bookkeeping state mirroring the fd's presence in the `Poller`'s epoll set.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Index {
    New,
    Added,
    Deleted,
}

/// One fd's interest set and callbacks. A `Channel` does not own its fd;
/// the fd's owner (an `Acceptor`, `Connector`, `TcpConnection`, or the
/// event loop's own wakeup `EventFd`) outlives it and closes the fd itself.
///
/// A bare `Channel` knows nothing about the loop it's registered with: its
/// owner calls `enable_reading`/`enable_writing`/`remove` etc, passing the
/// owning loop's `Poller` explicitly, each time the interest set changes.
pub struct Channel {
    fd: RawFd,
    events: Ready,
    revents: Ready,
    pub(crate) index: Index,
    event_handling: bool,
    pub(crate) added_to_loop: bool,

    read_callback: Option<ReadEventCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

impl Channel {
    pub fn new(fd: RawFd) -> Channel {
        Channel {
            fd,
            events: Ready::empty(),
            revents: Ready::empty(),
            index: Index::New,
            event_handling: false,
            added_to_loop: false,
            read_callback: None,
            write_callback: None,
            close_callback: None,
            error_callback: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> Token {
        Token(self.fd as usize)
    }

    pub fn events(&self) -> Ready {
        self.events
    }

    pub(crate) fn set_events(&mut self, events: Ready) {
        self.events = events;
    }

    pub(crate) fn set_revents(&mut self, revents: Ready) {
        self.revents = revents;
    }

    pub fn is_writing(&self) -> bool {
        self.events.is_writable()
    }

    pub fn is_reading(&self) -> bool {
        self.events.is_readable()
    }

    pub fn is_none_event(&self) -> bool {
        self.events.is_empty()
    }

    pub fn enable_reading(&mut self, poller: &mut Poller) {
        self.events.insert(Ready::readable());
        self.update(poller);
    }

    pub fn disable_reading(&mut self, poller: &mut Poller) {
        self.events.remove(Ready::readable());
        self.update(poller);
    }

    pub fn enable_writing(&mut self, poller: &mut Poller) {
        self.events.insert(Ready::writable());
        self.update(poller);
    }

    pub fn disable_writing(&mut self, poller: &mut Poller) {
        self.events.remove(Ready::writable());
        self.update(poller);
    }

    pub fn disable_all(&mut self, poller: &mut Poller) {
        self.events = Ready::empty();
        self.update(poller);
    }

    fn update(&mut self, poller: &mut Poller) {
        self.added_to_loop = true;
        poller.update_channel(self);
    }

    /// Deregisters the fd from `poller`. The owner must call this before
    /// dropping the `Channel`; `Drop` asserts it already happened.
    pub fn remove(&mut self, poller: &mut Poller) {
        debug_assert!(self.is_none_event());
        self.added_to_loop = false;
        poller.remove_channel(self);
    }

    pub fn set_read_callback(&mut self, cb: ReadEventCallback) {
        self.read_callback = Some(cb);
    }

    pub fn set_write_callback(&mut self, cb: EventCallback) {
        self.write_callback = Some(cb);
    }

    pub fn set_close_callback(&mut self, cb: EventCallback) {
        self.close_callback = Some(cb);
    }

    pub fn set_error_callback(&mut self, cb: EventCallback) {
        self.error_callback = Some(cb);
    }

    /// Dispatches to callbacks in a fixed priority order: a hangup
    /// without a pending read wins over an error, which wins over
    /// readability, which wins over writability. Only used by owners (like
    /// `Connector`) whose `Channel` isn't reachable through its own
    /// `Mutex<Channel>`. See `Channel::dispatch` for the mutex-guarded
    /// case, which this is not safe to use for.
    pub fn handle_event(&mut self, receive_time: Timestamp) {
        self.event_handling = true;

        if self.revents.is_hup() && !self.revents.is_readable() {
            if let Some(cb) = self.close_callback.as_mut() {
                cb();
            }
        } else if self.revents.is_error() {
            if let Some(cb) = self.error_callback.as_mut() {
                cb();
            }
        } else if self.revents.is_readable() {
            if let Some(cb) = self.read_callback.as_mut() {
                cb(receive_time);
            }
        } else if self.revents.is_writable() {
            if let Some(cb) = self.write_callback.as_mut() {
                cb();
            }
        }

        self.event_handling = false;
    }

    /// Picks the callback `revents` selects (same priority as
    /// `handle_event`) and removes it from `self`, so the caller can run it
    /// without this `Channel` borrowed.
    fn take_dispatch(&mut self) -> DispatchedEvent {
        if self.revents.is_hup() && !self.revents.is_readable() {
            self.close_callback.take().map(DispatchedEvent::Close).unwrap_or(DispatchedEvent::None)
        } else if self.revents.is_error() {
            self.error_callback.take().map(DispatchedEvent::Error).unwrap_or(DispatchedEvent::None)
        } else if self.revents.is_readable() {
            self.read_callback.take().map(DispatchedEvent::Read).unwrap_or(DispatchedEvent::None)
        } else if self.revents.is_writable() {
            self.write_callback.take().map(DispatchedEvent::Write).unwrap_or(DispatchedEvent::None)
        } else {
            DispatchedEvent::None
        }
    }

    fn restore_dispatch(&mut self, event: DispatchedEvent) {
        match event {
            DispatchedEvent::Read(cb) => self.read_callback = Some(cb),
            DispatchedEvent::Write(cb) => self.write_callback = Some(cb),
            DispatchedEvent::Close(cb) => self.close_callback = Some(cb),
            DispatchedEvent::Error(cb) => self.error_callback = Some(cb),
            DispatchedEvent::None => {}
        }
    }

    /// Runs whichever callback `revents` selects without holding `guard`'s
    /// lock across the call, unlike `handle_event`. A callback fired this
    /// way (e.g. a `TcpConnection`'s message callback reacting to a read)
    /// may itself need to reacquire the same lock, such as when it turns
    /// around and calls `send()`/`shutdown()` on the very connection it was
    /// just invoked for; holding the lock across the call would deadlock
    /// that re-entry on this (single, loop-owning) thread.
    pub fn dispatch(guard: &Mutex<Channel>, revents: Ready, receive_time: Timestamp) {
        let event = {
            let mut channel = guard.lock().unwrap();
            channel.set_revents(revents);
            channel.event_handling = true;
            channel.take_dispatch()
        };

        let event = match event {
            DispatchedEvent::Close(mut cb) => { cb(); DispatchedEvent::Close(cb) }
            DispatchedEvent::Error(mut cb) => { cb(); DispatchedEvent::Error(cb) }
            DispatchedEvent::Read(mut cb) => { cb(receive_time); DispatchedEvent::Read(cb) }
            DispatchedEvent::Write(mut cb) => { cb(); DispatchedEvent::Write(cb) }
            DispatchedEvent::None => DispatchedEvent::None,
        };

        let mut channel = guard.lock().unwrap();
        channel.restore_dispatch(event);
        channel.event_handling = false;
    }
}

/// A callback taken out of a `Channel` by `take_dispatch`, tagged with
/// which slot it came from so `restore_dispatch` can put it back.
enum DispatchedEvent {
    Read(ReadEventCallback),
    Write(EventCallback),
    Close(EventCallback),
    Error(EventCallback),
    None,
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling);
        debug_assert!(!self.added_to_loop);
    }
}
