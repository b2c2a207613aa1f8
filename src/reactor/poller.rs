use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use indexmap::IndexSet;
use log::{debug, error, warn};

use crate::epoll::{Epoll, EpollOpt, Events, Ready, Token};

use super::channel::{Channel, Index};
use super::timestamp::Timestamp;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Epoll-backed readiness multiplexer for one `EventLoop`. Tracks which fds
/// are currently registered so `update_channel`/`remove_channel` can assert
/// that a channel's `Index` bookkeeping matches what's really in the epoll
/// set.
pub struct Poller {
    epoll: Epoll,
    event_list: Events,
    channels: IndexSet<RawFd>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            epoll: Epoll::new()?,
            event_list: Events::with_capacity(INIT_EVENT_LIST_SIZE),
            channels: IndexSet::new(),
        })
    }

    /// Waits for readiness, returning the timestamp readiness was observed
    /// at and the `(token, readiness)` pairs for every active fd. Doubles
    /// the event buffer whenever it came back completely full, the same
    /// growth rule `EpollPoller::poll` uses.
    pub fn poll(&mut self, timeout_ms: i64) -> io::Result<(Timestamp, Vec<(Token, Ready)>)> {
        let timeout = if timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(timeout_ms as u64))
        };

        let num_events = match self.epoll.wait(&mut self.event_list, timeout) {
            Ok(n) => n,
            Err(e) => {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!("Poller::poll() error: {}", e);
                }
                0
            }
        };

        let now = Timestamp::now();
        let mut active = Vec::with_capacity(num_events);

        if num_events > 0 {
            debug!("epoll_wait returned {} events", num_events);
            for event in self.event_list.iter() {
                active.push((event.token(), event.readiness()));
            }
            if num_events == self.event_list.capacity() {
                self.event_list = Events::with_capacity(self.event_list.capacity() * 2);
            }
        } else {
            debug!("epoll_wait timeout");
        }

        Ok((now, active))
    }

    pub fn update_channel(&mut self, channel: &mut Channel) {
        let fd = channel.fd();
        match channel.index {
            Index::New | Index::Deleted => {
                if channel.index == Index::New {
                    debug_assert!(!self.channels.contains(&fd));
                    self.channels.insert(fd);
                } else {
                    debug_assert!(self.channels.contains(&fd));
                }
                channel.index = Index::Added;
                if let Err(e) = self.epoll.add(&fd, channel.token(), channel.events(), EpollOpt::level()) {
                    warn!("epoll_ctl ADD fd={} failed: {}", fd, e);
                }
            }
            Index::Added => {
                debug_assert!(self.channels.contains(&fd));
                if channel.is_none_event() {
                    if let Err(e) = self.epoll.delete(&fd) {
                        warn!("epoll_ctl DEL fd={} failed: {}", fd, e);
                    }
                    channel.index = Index::Deleted;
                } else if let Err(e) = self.epoll.modify(&fd, channel.token(), channel.events(), EpollOpt::level()) {
                    warn!("epoll_ctl MOD fd={} failed: {}", fd, e);
                }
            }
        }
    }

    pub fn remove_channel(&mut self, channel: &mut Channel) {
        let fd = channel.fd();
        debug_assert!(self.channels.contains(&fd));
        debug_assert!(channel.is_none_event());

        self.channels.shift_remove(&fd);
        if channel.index == Index::Added {
            if let Err(e) = self.epoll.delete(&fd) {
                warn!("epoll_ctl DEL fd={} failed: {}", fd, e);
            }
        }
        channel.index = Index::New;
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains(&fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_eventfd_channel() {
        let mut poller = Poller::new().unwrap();
        let efd = crate::sys::EventFd::new().unwrap();
        let mut channel = Channel::new(std::os::unix::io::AsRawFd::as_raw_fd(&efd));

        channel.enable_reading(&mut poller);
        assert!(poller.has_channel(channel.fd()));

        efd.write(1).unwrap();
        let (_now, active) = poller.poll(100).unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].1.is_readable());

        channel.disable_all(&mut poller);
        channel.remove(&mut poller);
        assert!(!poller.has_channel(channel.fd()));
    }
}
