//! Loop backends: the minimal kernel-multiplexing interface the selector
//! drives. Two variants, chosen at construction: epoll (Linux) and poll
//! (portable fallback). Event bits stay backend-specific; the selector
//! interprets them through the `is_*_event` predicates.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{desire, SelectorEvent};

#[cfg(target_os = "linux")]
const POLL_RDHUP: libc::c_short = libc::POLLRDHUP;
#[cfg(not(target_os = "linux"))]
const POLL_RDHUP: libc::c_short = 0;

/// Clamp a wait timeout to at least one millisecond.
fn wait_timeout_ms(timeout: Duration) -> libc::c_int {
    let timeout = timeout.max(Duration::from_millis(1));
    timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
}

/// The backend alternatives. Desires use [`desire`] bits on the way in;
/// `wait` reports both translated desires and the raw kernel bits.
pub(crate) enum LoopBackend {
    #[cfg(target_os = "linux")]
    Epoll(EpollLoop),
    Poll(PollLoop),
}

impl LoopBackend {
    pub fn add(&mut self, fd: RawFd, desires: u32) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            LoopBackend::Epoll(inner) => inner.add(fd, desires),
            LoopBackend::Poll(inner) => inner.add(fd, desires),
        }
    }

    pub fn update(&mut self, fd: RawFd, desires: u32) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            LoopBackend::Epoll(inner) => inner.update(fd, desires),
            LoopBackend::Poll(inner) => inner.update(fd, desires),
        }
    }

    pub fn remove(&mut self, fd: RawFd) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            LoopBackend::Epoll(inner) => inner.remove(fd),
            LoopBackend::Poll(inner) => inner.remove(fd),
        }
    }

    pub fn wait(&mut self, timeout: Duration) -> Result<Vec<SelectorEvent>> {
        match self {
            #[cfg(target_os = "linux")]
            LoopBackend::Epoll(inner) => inner.wait(timeout),
            LoopBackend::Poll(inner) => inner.wait(timeout),
        }
    }

    pub fn is_hang_up_event(&self, raw: u32) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            LoopBackend::Epoll(_) => raw & libc::EPOLLHUP as u32 != 0,
            LoopBackend::Poll(_) => raw & libc::POLLHUP as u32 != 0,
        }
    }

    pub fn is_remote_hang_up_event(&self, raw: u32) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            LoopBackend::Epoll(_) => raw & libc::EPOLLRDHUP as u32 != 0,
            LoopBackend::Poll(_) => raw & POLL_RDHUP as u32 != 0,
        }
    }

    pub fn is_any_hang_up_event(&self, raw: u32) -> bool {
        self.is_hang_up_event(raw) || self.is_remote_hang_up_event(raw)
    }

    pub fn is_error_event(&self, raw: u32) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            LoopBackend::Epoll(_) => raw & libc::EPOLLERR as u32 != 0,
            LoopBackend::Poll(_) => raw & libc::POLLERR as u32 != 0,
        }
    }

    pub fn is_input_event(&self, raw: u32) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            LoopBackend::Epoll(_) => raw & libc::EPOLLIN as u32 != 0,
            LoopBackend::Poll(_) => raw & libc::POLLIN as u32 != 0,
        }
    }
}

// ── epoll ───────────────────────────────────────────────────────────────

/// Loop backend over `epoll(7)`. Events are pulled into a fixed buffer of
/// `max_events_per_step` entries per wait.
#[cfg(target_os = "linux")]
pub(crate) struct EpollLoop {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
}

#[cfg(target_os = "linux")]
impl EpollLoop {
    pub fn new(signal_fd: RawFd, max_events_per_step: usize) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::last_os("::epoll_create1 failed"));
        }
        let mut this = EpollLoop {
            epfd,
            events: vec![unsafe { std::mem::zeroed() }; max_events_per_step.max(1)],
        };
        this.add(signal_fd, desire::READ | desire::ERROR)?;
        Ok(this)
    }

    fn desires_to_events(desires: u32) -> u32 {
        let mut events = 0u32;
        if desires & desire::READ != 0 {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if desires & desire::WRITE != 0 {
            events |= libc::EPOLLOUT as u32;
        }
        if desires & desire::ERROR != 0 {
            events |= (libc::EPOLLERR | libc::EPOLLHUP) as u32;
        }
        events
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, desires: u32) -> Result<()> {
        let mut event = libc::epoll_event {
            events: Self::desires_to_events(desires),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if ret < 0 {
            return Err(Error::last_os(format!(
                "::epoll_ctl op {op} failed for fd {fd}"
            )));
        }
        Ok(())
    }

    pub fn add(&mut self, fd: RawFd, desires: u32) -> Result<()> {
        debug_assert!(fd >= 0, "invalid fd added to epoll");
        self.ctl(libc::EPOLL_CTL_ADD, fd, desires)
    }

    pub fn update(&mut self, fd: RawFd, desires: u32) -> Result<()> {
        debug_assert!(fd >= 0, "invalid fd updated in epoll");
        self.ctl(libc::EPOLL_CTL_MOD, fd, desires)
    }

    pub fn remove(&mut self, fd: RawFd) -> Result<()> {
        debug_assert!(fd >= 0, "invalid fd removed from epoll");
        let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut event) };
        if ret < 0 {
            return Err(Error::last_os(format!(
                "::epoll_ctl EPOLL_CTL_DEL failed for fd {fd}"
            )));
        }
        Ok(())
    }

    pub fn wait(&mut self, timeout: Duration) -> Result<Vec<SelectorEvent>> {
        let num_events = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                wait_timeout_ms(timeout),
            )
        };
        if num_events < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(Vec::new());
            }
            return Err(Error::last_os("::epoll_wait failed"));
        }
        let mut events = Vec::with_capacity(num_events as usize);
        for event in &self.events[..num_events as usize] {
            let mut desires = 0u32;
            if event.events & (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
                desires |= desire::ERROR;
            }
            if event.events & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
                desires |= desire::READ;
            }
            if event.events & libc::EPOLLOUT as u32 != 0 {
                desires |= desire::WRITE;
            }
            events.push(SelectorEvent {
                fd: event.u64 as RawFd,
                desires,
                raw: event.events,
            });
        }
        Ok(events)
    }
}

#[cfg(target_os = "linux")]
impl Drop for EpollLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

// ── poll ────────────────────────────────────────────────────────────────

/// Upper bound on descriptors the poll backend tracks.
const MAX_POLL_FDS: usize = 4096;

/// Loop backend over `poll(2)`: a dense `pollfd` array plus an fd → index
/// map. Removals punch holes that are compacted at the start of the next
/// wait, so events already collected for a step are not lost.
pub(crate) struct PollLoop {
    fds: Vec<libc::pollfd>,
    fd_index: HashMap<RawFd, usize>,
    to_compact: Vec<usize>,
}

impl PollLoop {
    pub fn new(signal_fd: RawFd, _max_events_per_step: usize) -> Result<Self> {
        let mut this = PollLoop {
            fds: Vec::new(),
            fd_index: HashMap::new(),
            to_compact: Vec::new(),
        };
        this.add(signal_fd, desire::READ | desire::ERROR)?;
        Ok(this)
    }

    fn desires_to_events(desires: u32) -> libc::c_short {
        let mut events: libc::c_short = 0;
        if desires & desire::READ != 0 {
            events |= libc::POLLIN | POLL_RDHUP;
        }
        if desires & desire::WRITE != 0 {
            events |= libc::POLLOUT;
        }
        if desires & desire::ERROR != 0 {
            events |= libc::POLLERR | libc::POLLHUP;
        }
        events
    }

    pub fn add(&mut self, fd: RawFd, desires: u32) -> Result<()> {
        debug_assert!(fd >= 0, "invalid fd added to poll");
        if self.fds.len() >= MAX_POLL_FDS {
            return Err(Error::Unavailable(format!(
                "poll backend is at its limit of {MAX_POLL_FDS} file descriptors"
            )));
        }
        self.fds.push(libc::pollfd {
            fd,
            events: Self::desires_to_events(desires),
            revents: 0,
        });
        self.fd_index.insert(fd, self.fds.len() - 1);
        Ok(())
    }

    pub fn update(&mut self, fd: RawFd, desires: u32) -> Result<()> {
        let index = *self.fd_index.get(&fd).ok_or_else(|| {
            Error::NotFound(format!("fd {fd} is not registered with the poll backend"))
        })?;
        self.fds[index].events = Self::desires_to_events(desires);
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd) -> Result<()> {
        let index = self.fd_index.remove(&fd).ok_or_else(|| {
            Error::NotFound(format!("fd {fd} is not registered with the poll backend"))
        })?;
        // Leave a hole for now; compaction mid-step would drop events that
        // were already collected for this iteration.
        self.fds[index].fd = -1;
        self.to_compact.push(index);
        Ok(())
    }

    fn compact(&mut self) {
        if self.to_compact.is_empty() {
            return;
        }
        self.to_compact.sort_unstable();
        for &index in self.to_compact.iter().rev() {
            let last = self.fds.len() - 1;
            if index < last {
                let moved = self.fds[last];
                self.fds[index] = moved;
                self.fds[index].revents = 0;
                if let Some(slot) = self.fd_index.get_mut(&moved.fd) {
                    *slot = index;
                }
            }
            self.fds.pop();
        }
        self.to_compact.clear();
    }

    pub fn wait(&mut self, timeout: Duration) -> Result<Vec<SelectorEvent>> {
        self.compact();
        let num_events = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                wait_timeout_ms(timeout),
            )
        };
        if num_events < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(Vec::new());
            }
            return Err(Error::last_os("::poll failed"));
        }
        let mut events = Vec::with_capacity(num_events as usize);
        let mut remaining = num_events;
        for entry in &self.fds {
            if remaining == 0 {
                break;
            }
            if entry.revents == 0 {
                continue;
            }
            remaining -= 1;
            let revents = entry.revents;
            let mut desires = 0u32;
            if revents & (libc::POLLERR | libc::POLLHUP | POLL_RDHUP) != 0 {
                desires |= desire::ERROR;
            }
            if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                desires |= desire::READ;
            }
            if revents & libc::POLLOUT != 0 {
                desires |= desire::WRITE;
            }
            if self.fd_index.contains_key(&entry.fd) {
                events.push(SelectorEvent {
                    fd: entry.fd,
                    desires,
                    raw: revents as u32,
                });
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonblocking_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        (fds[0], fds[1])
    }

    fn close_pair(pair: (RawFd, RawFd)) {
        unsafe {
            libc::close(pair.0);
            libc::close(pair.1);
        }
    }

    #[test]
    fn poll_reports_readable_fd() {
        let signal = nonblocking_pipe();
        let data = nonblocking_pipe();
        let mut backend = PollLoop::new(signal.0, 16).unwrap();
        backend.add(data.0, desire::READ | desire::ERROR).unwrap();

        let events = backend.wait(Duration::from_millis(1)).unwrap();
        assert!(events.is_empty());

        unsafe {
            libc::write(data.1, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let events = backend.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, data.0);
        assert_ne!(events[0].desires & desire::READ, 0);
        assert_ne!(events[0].raw & libc::POLLIN as u32, 0);

        close_pair(signal);
        close_pair(data);
    }

    #[test]
    fn poll_remove_compacts_lazily() {
        let signal = nonblocking_pipe();
        let a = nonblocking_pipe();
        let b = nonblocking_pipe();
        let mut backend = PollLoop::new(signal.0, 16).unwrap();
        backend.add(a.0, desire::READ).unwrap();
        backend.add(b.0, desire::READ).unwrap();
        backend.remove(a.0).unwrap();
        assert!(backend.remove(a.0).is_err());

        // The survivor still reports events after compaction.
        unsafe {
            libc::write(b.1, b"y".as_ptr() as *const libc::c_void, 1);
        }
        let events = backend.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, b.0);

        close_pair(signal);
        close_pair(a);
        close_pair(b);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn epoll_reports_readable_fd() {
        let signal = nonblocking_pipe();
        let data = nonblocking_pipe();
        let mut backend = EpollLoop::new(signal.0, 16).unwrap();
        backend.add(data.0, desire::READ | desire::ERROR).unwrap();

        unsafe {
            libc::write(data.1, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let events = backend.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, data.0);
        assert_ne!(events[0].desires & desire::READ, 0);

        backend.remove(data.0).unwrap();
        close_pair(signal);
        close_pair(data);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn epoll_write_desire() {
        let signal = nonblocking_pipe();
        let data = nonblocking_pipe();
        let mut backend = EpollLoop::new(signal.0, 16).unwrap();
        backend
            .add(data.1, desire::WRITE | desire::ERROR)
            .unwrap();
        let events = backend.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, data.1);
        assert_ne!(events[0].desires & desire::WRITE, 0);
        close_pair(signal);
        close_pair(data);
    }
}
