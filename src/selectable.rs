//! The capability a selector observes: a file descriptor, a desire mask
//! and three event handlers.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chain::ByteChain;
use crate::error::{Error, Result};
use crate::event::{desire, SelectorEvent, INVALID_FD};
use crate::selector::Selector;

/// Shared bookkeeping embedded by every [`Selectable`] implementor: the
/// file descriptor, the desire mask (touched only by the owning selector)
/// and the owner back-reference.
///
/// The back-reference is the ownership marker: it must be `None` before a
/// registration with a new selector, is set by `register` and cleared by
/// `unregister`. The selector itself keeps only a weak entry per fd.
pub struct SelectableBase {
    fd: AtomicI32,
    desire: AtomicU32,
    selector: Mutex<Option<Arc<Selector>>>,
}

impl SelectableBase {
    pub fn new() -> Self {
        SelectableBase {
            fd: AtomicI32::new(INVALID_FD),
            // Read and error events are desired by default.
            desire: AtomicU32::new(desire::READ | desire::ERROR),
            selector: Mutex::new(None),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    pub(crate) fn set_fd(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::Release);
    }

    /// Swap the fd for the invalid sentinel and return the previous value.
    pub(crate) fn take_fd(&self) -> RawFd {
        self.fd.swap(INVALID_FD, Ordering::AcqRel)
    }

    #[inline]
    pub fn desire(&self) -> u32 {
        self.desire.load(Ordering::Acquire)
    }

    pub(crate) fn set_desire(&self, desire: u32) {
        self.desire.store(desire, Ordering::Release);
    }

    /// The selector currently owning this object, if registered.
    pub fn selector(&self) -> Option<Arc<Selector>> {
        self.selector.lock().clone()
    }

    pub(crate) fn set_selector(&self, value: Option<Arc<Selector>>) {
        let mut slot = self.selector.lock();
        debug_assert!(
            slot.is_none() || value.is_none(),
            "selectable already owned by a selector"
        );
        *slot = value;
    }
}

impl Default for SelectableBase {
    fn default() -> Self {
        Self::new()
    }
}

/// An object a [`Selector`] multiplexes: exposes a file descriptor and
/// reacts to readiness events. Exactly one selector owns a selectable at a
/// time; all handlers run on that selector's thread.
///
/// Handlers return `true` to keep processing further sub-events for this
/// object within the current loop step. Closing the object (invalidating
/// its fd) also stops further dispatch.
pub trait Selectable: Send + Sync {
    /// The shared bookkeeping record.
    fn base(&self) -> &SelectableBase;

    /// The registered file descriptor, or [`INVALID_FD`] when closed.
    fn fd(&self) -> RawFd {
        self.base().fd()
    }

    /// The fd is readable.
    fn handle_read_event(&self, _event: SelectorEvent) -> bool {
        true
    }

    /// The fd is writable.
    fn handle_write_event(&self, _event: SelectorEvent) -> bool {
        true
    }

    /// An error or hang-up was signaled for the fd.
    fn handle_error_event(&self, _event: SelectorEvent) -> bool {
        true
    }

    /// Close this object and its fd, unregistering from the selector.
    /// Invoked by `clean_and_close_all` at loop teardown.
    fn close(&self);
}

// ── fd I/O helpers ──────────────────────────────────────────────────────

/// `read` into `buf`; would-block maps to `Ok(0)`.
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let cb = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if cb >= 0 {
        return Ok(cb as usize);
    }
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR {
        return Ok(0);
    }
    Err(Error::from_errno(
        errno,
        format!("reading {} bytes from fd {fd}", buf.len()),
    ))
}

/// Read up to `len` bytes from `fd`, appending them to `chain`.
pub(crate) fn read_to_chain(fd: RawFd, chain: &mut ByteChain, len: usize) -> Result<usize> {
    let mut buf = vec![0u8; len];
    let cb = read_fd(fd, &mut buf)?;
    if cb > 0 {
        buf.truncate(cb);
        chain.append(bytes::Bytes::from(buf));
    }
    Ok(cb)
}

/// Maximum iovecs passed to a single `writev`.
const MAX_WRITE_IOVECS: usize = 64;

/// Vectored write of the chain's leading segments, clipped to `limit`
/// bytes. Would-block maps to `Ok(0)`; the caller drops the written prefix.
pub(crate) fn write_chain_vectored(
    fd: RawFd,
    chain: &ByteChain,
    limit: Option<usize>,
) -> Result<usize> {
    let budget = limit.unwrap_or(usize::MAX).min(chain.len());
    if budget == 0 {
        return Ok(0);
    }
    let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(MAX_WRITE_IOVECS);
    let mut gathered = 0usize;
    for segment in chain.segments() {
        if gathered >= budget || iovecs.len() >= MAX_WRITE_IOVECS {
            break;
        }
        let take = segment.len().min(budget - gathered);
        iovecs.push(libc::iovec {
            iov_base: segment.as_ptr() as *mut libc::c_void,
            iov_len: take,
        });
        gathered += take;
    }
    let cb = unsafe { libc::writev(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int) };
    if cb >= 0 {
        return Ok(cb as usize);
    }
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR {
        return Ok(0);
    }
    Err(Error::from_errno(
        errno,
        format!("vectored write of {gathered} bytes to fd {fd}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn base_defaults() {
        let base = SelectableBase::new();
        assert_eq!(base.fd(), INVALID_FD);
        assert_eq!(base.desire(), desire::READ | desire::ERROR);
        assert!(base.selector().is_none());
    }

    #[test]
    fn take_fd_invalidates() {
        let base = SelectableBase::new();
        base.set_fd(42);
        assert_eq!(base.take_fd(), 42);
        assert_eq!(base.fd(), INVALID_FD);
        assert_eq!(base.take_fd(), INVALID_FD);
    }

    #[test]
    fn chain_write_and_read_through_pipe() {
        let (rd, wr) = pipe_pair();
        let mut out = ByteChain::new();
        out.append_slice(b"hello ");
        out.append_slice(b"vectored ");
        out.append_slice(b"world");
        let written = write_chain_vectored(wr, &out, None).unwrap();
        assert_eq!(written, out.len());

        let mut chain = ByteChain::new();
        let read = read_to_chain(rd, &mut chain, 64).unwrap();
        assert_eq!(read, written);
        assert_eq!(chain.to_vec(), b"hello vectored world");
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn write_respects_limit() {
        let (rd, wr) = pipe_pair();
        let mut out = ByteChain::new();
        out.append_slice(b"abcdef");
        let written = write_chain_vectored(wr, &out, Some(4)).unwrap();
        assert_eq!(written, 4);
        let mut chain = ByteChain::new();
        read_to_chain(rd, &mut chain, 16).unwrap();
        assert_eq!(chain.to_vec(), b"abcd");
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
