use std::os::fd::RawFd;

/// Sentinel for "no file descriptor".
pub const INVALID_FD: RawFd = -1;

/// The operations a [`Selectable`](crate::Selectable) asks its selector to
/// observe on its file descriptor. A desire mask is an OR of these bits.
pub mod desire {
    pub const READ: u32 = 1;
    pub const WRITE: u32 = 2;
    pub const ERROR: u32 = 4;
}

/// One readiness event delivered by a loop backend.
#[derive(Clone, Copy, Debug)]
pub struct SelectorEvent {
    /// The file descriptor the event fired for.
    pub fd: RawFd,
    /// Which desires were observed — an OR of [`desire`] bits.
    pub desires: u32,
    /// The raw backend event bits (epoll or poll flags). Interpret through
    /// the selector's `is_*_event` predicates, never directly.
    pub raw: u32,
}
