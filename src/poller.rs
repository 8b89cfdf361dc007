use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::trace;

use crate::channel::{Channel, PollState};
use crate::token::Token;

/// Initial size of the active-event scratch buffer passed to
/// `epoll_wait(2)`; doubles on saturation. Grounded on muduo's
/// `EPollPoller::kInitEventListSize`.
const INIT_EVENT_LIST_SIZE: usize = 16;

/// Thin `epoll(7)` wrapper: owns the epoll fd and a `Token -> Weak<Channel>`
/// map, and turns one `epoll_wait` call into a list of ready channels.
///
/// Grounded on muduo's `EPollPoller.cc` for the registration state
/// machine and growth policy, and on `tokio-rs-mio`'s
/// `src/sys/unix/selector/epoll.rs` for the raw `epoll_ctl`/`epoll_wait`
/// plumbing. Registration is level-triggered: unlike mio's `Selector`,
/// which always sets `EPOLLET`, this poller matches the source's
/// level-triggered semantics (`Channel`/`TcpConnection` read and write
/// handlers are written assuming a ready fd stays ready until fully
/// drained, not edge-triggered one-shot wakeups).
pub struct Poller {
    epoll_fd: RawFd,
    channels: HashMap<Token, Weak<Channel>>,
    event_list: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let epoll_fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Poller {
            epoll_fd,
            channels: HashMap::new(),
            event_list: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
        })
    }

    pub fn has_channel(&self, token: Token) -> bool {
        self.channels.contains_key(&token)
    }

    /// Register or re-register a channel's current interest set.
    /// Grounded on `EPollPoller::updateChannel`.
    pub fn update_channel(&mut self, channel: &Arc<Channel>) -> io::Result<()> {
        let token = channel.token();
        match channel.poll_state() {
            PollState::New | PollState::Deleted => {
                self.channels.insert(token, Arc::downgrade(channel));
                self.epoll_ctl(libc::EPOLL_CTL_ADD, channel, token)?;
                channel.set_poll_state(PollState::Added);
            }
            PollState::Added => {
                if channel.is_none_interest() {
                    self.epoll_ctl(libc::EPOLL_CTL_DEL, channel, token)?;
                    channel.set_poll_state(PollState::Deleted);
                } else {
                    self.epoll_ctl(libc::EPOLL_CTL_MOD, channel, token)?;
                }
            }
        }
        Ok(())
    }

    /// Deregister a channel entirely. Grounded on `EPollPoller::removeChannel`.
    pub fn remove_channel(&mut self, channel: &Arc<Channel>) -> io::Result<()> {
        let token = channel.token();
        self.channels.remove(&token);
        if channel.poll_state() == PollState::Added {
            self.epoll_ctl(libc::EPOLL_CTL_DEL, channel, token)?;
        }
        channel.set_poll_state(PollState::New);
        Ok(())
    }

    fn epoll_ctl(&self, op: libc::c_int, channel: &Arc<Channel>, token: Token) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: to_epoll_events(channel.interest()),
            u64: usize::from(token) as u64,
        };
        let event_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event as *mut libc::epoll_event
        };
        syscall!(epoll_ctl(self.epoll_fd, op, channel.fd(), event_ptr)).map(|_| ())
    }

    /// Block for up to `timeout` (or forever if `None`) and return the
    /// channels that became ready, with their `revents` already recorded.
    /// Grounded on `EPollPoller::poll`.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        active_channels: &mut Vec<Arc<Channel>>,
    ) -> io::Result<Instant> {
        active_channels.clear();

        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };

        let n = loop {
            match syscall!(epoll_wait(
                self.epoll_fd,
                self.event_list.as_mut_ptr(),
                self.event_list.len() as libc::c_int,
                timeout_ms,
            )) {
                Ok(n) => break n as usize,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        };
        let now = Instant::now();

        trace!("Poller::poll {} events happened", n);
        for raw_event in &self.event_list[..n] {
            let token = Token(raw_event.u64 as usize);
            if let Some(channel) = self.channels.get(&token).and_then(Weak::upgrade) {
                channel.set_revents(raw_event.events);
                active_channels.push(channel);
            }
        }

        if n == self.event_list.len() {
            let new_len = self.event_list.len() * 2;
            self.event_list
                .resize(new_len, libc::epoll_event { events: 0, u64: 0 });
        }

        Ok(now)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

fn to_epoll_events(interest: crate::interest::Interest) -> u32 {
    let mut events = 0u32;
    if interest.is_readable() {
        events |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Weak;

    /// `Channel::enable_reading` sets the interest field and calls
    /// `update()`, which is a no-op when there is no owning loop (as here);
    /// driving `Poller::update_channel` directly still exercises the same
    /// registration path `EventLoop::update_channel` would.
    #[test]
    fn poll_reports_a_readable_fd() {
        let mut poller = Poller::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let fd = rx.as_raw_fd();
        let channel = Channel::new(Weak::new(), fd, Token(fd as usize));
        channel.enable_reading();
        poller.update_channel(&channel).unwrap();

        tx.write_all(b"x").unwrap();

        let mut active = Vec::new();
        poller
            .poll(Some(Duration::from_secs(5)), &mut active)
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].fd(), fd);
    }

    #[test]
    fn remove_channel_unregisters_and_clears_has_channel() {
        let mut poller = Poller::new().unwrap();
        let (_tx, rx) = UnixStream::pair().unwrap();
        let fd = rx.as_raw_fd();
        let token = Token(fd as usize);
        let channel = Channel::new(Weak::new(), fd, token);
        channel.enable_reading();
        poller.update_channel(&channel).unwrap();
        assert!(poller.has_channel(token));

        poller.remove_channel(&channel).unwrap();
        assert!(!poller.has_channel(token));
    }

    #[test]
    fn event_list_doubles_once_saturated() {
        let mut poller = Poller::new().unwrap();
        assert_eq!(poller.event_list.len(), INIT_EVENT_LIST_SIZE);

        let mut streams = Vec::new();
        for _ in 0..INIT_EVENT_LIST_SIZE {
            let (tx, rx) = UnixStream::pair().unwrap();
            let fd = rx.as_raw_fd();
            let channel = Channel::new(Weak::new(), fd, Token(fd as usize));
            channel.enable_reading();
            poller.update_channel(&channel).unwrap();
            streams.push((tx, rx, channel));
        }
        for (tx, _rx, _channel) in &mut streams {
            tx.write_all(b"x").unwrap();
        }

        let mut active = Vec::new();
        poller
            .poll(Some(Duration::from_secs(5)), &mut active)
            .unwrap();
        assert_eq!(active.len(), INIT_EVENT_LIST_SIZE);
        assert!(poller.event_list.len() > INIT_EVENT_LIST_SIZE);
    }
}
