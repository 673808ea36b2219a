//! The non-blocking TCP connection state machine.
//!
//! ```text
//! Disconnected ── connect(unresolved) ──► Resolving
//! Disconnected ── connect(resolved)   ──► Connecting
//! Resolving    ── dns ok              ──► Connecting
//! Resolving    ── dns err / close     ──► Disconnected
//! Connecting   ── first I/O event     ──► Connected
//! Connected    ── close_communication ──► Flushing
//! Flushing     ── outbuf drained      ──► shutdown(SHUT_WR), linger
//! any          ── fatal error         ──► Disconnected
//! ```
//!
//! All state mutation happens on the owning selector thread;
//! `flush_and_close`, `force_close` and `close_communication` repost
//! themselves through the deferred queue when called from elsewhere.

use std::fmt;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::addr::{self, HostPort};
use crate::chain::ByteChain;
use crate::config::TcpConnectionParams;
use crate::dns::{DnsResolver, DnsResult};
use crate::error::{Error, Result, Status};
use crate::event::{SelectorEvent, INVALID_FD};
use crate::metrics;
use crate::selectable::{self, Selectable, SelectableBase};
use crate::selector::Selector;
use crate::timeouter::{TimeoutId, Timeouter};

/// Extract the pending socket error from `fd` via `SO_ERROR`.
pub(crate) fn extract_socket_errno(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    }
    err
}

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Disconnected = 0,
    Resolving = 1,
    Connecting = 2,
    Connected = 3,
    Flushing = 4,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            1 => ConnState::Resolving,
            2 => ConnState::Connecting,
            3 => ConnState::Connected,
            4 => ConnState::Flushing,
            _ => ConnState::Disconnected,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnState::Disconnected => "DISCONNECTED",
            ConnState::Resolving => "RESOLVING",
            ConnState::Connecting => "CONNECTING",
            ConnState::Connected => "CONNECTED",
            ConnState::Flushing => "FLUSHING",
        }
    }
}

/// Which half of the connection a close request concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseDirective {
    Read,
    Write,
    ReadWrite,
}

impl CloseDirective {
    pub fn name(&self) -> &'static str {
        match self {
            CloseDirective::Read => "CLOSE_READ",
            CloseDirective::Write => "CLOSE_WRITE",
            CloseDirective::ReadWrite => "CLOSE_READ_WRITE",
        }
    }
}

type ConnectHandler = Box<dyn FnMut() + Send>;
type ReadHandler = Box<dyn FnMut() -> Result<()> + Send>;
type WriteHandler = Box<dyn FnMut() -> Result<()> + Send>;
type CloseHandler = Box<dyn FnMut(&Status, CloseDirective) + Send>;

#[derive(Default)]
struct Handlers {
    connect: Option<ConnectHandler>,
    read: Option<ReadHandler>,
    write: Option<WriteHandler>,
    close: Option<CloseHandler>,
}

/// The linger timeout armed when the half-close is issued.
const SHUTDOWN_TIMEOUT_ID: TimeoutId = -100;

/// A non-blocking TCP byte stream pinned to one selector.
///
/// Obtained from a [`TcpAcceptor`](crate::TcpAcceptor) accept handler, or
/// built with [`TcpConnection::new`] and pointed at a remote with
/// [`connect`](TcpConnection::connect). Unresolved remotes go through the
/// default DNS resolver first.
pub struct TcpConnection {
    base: SelectableBase,
    selector: Arc<Selector>,
    params: TcpConnectionParams,
    state: AtomicU8,

    read_closed: AtomicBool,
    write_closed: AtomicBool,
    count_bytes_read: AtomicI64,
    count_bytes_written: AtomicI64,
    last_read_ts: AtomicI64,
    last_write_ts: AtomicI64,

    local_address: Mutex<HostPort>,
    remote_address: Mutex<HostPort>,
    last_error: Mutex<Status>,

    /// Bytes from the peer; selector-thread access only.
    inbuf: Mutex<ByteChain>,
    /// Bytes for the peer; selector-thread access only.
    outbuf: Mutex<ByteChain>,

    handlers: Mutex<Handlers>,
    timeouter: Timeouter,
    /// Set when a close arrives mid-resolve; honored when DNS completes.
    close_on_resolve: Mutex<Option<bool>>,

    weak_self: Weak<TcpConnection>,
}

impl TcpConnection {
    pub fn new(selector: Arc<Selector>, params: TcpConnectionParams) -> Arc<TcpConnection> {
        Arc::new_cyclic(|weak_self: &Weak<TcpConnection>| {
            let timeout_weak = weak_self.clone();
            let timeouter = Timeouter::new(selector.clone(), move |timeout_id| {
                if let Some(conn) = timeout_weak.upgrade() {
                    conn.handle_timeout_event(timeout_id);
                }
            });
            TcpConnection {
                base: SelectableBase::new(),
                selector,
                params,
                state: AtomicU8::new(ConnState::Disconnected as u8),
                read_closed: AtomicBool::new(false),
                write_closed: AtomicBool::new(false),
                count_bytes_read: AtomicI64::new(0),
                count_bytes_written: AtomicI64::new(0),
                last_read_ts: AtomicI64::new(i64::MIN),
                last_write_ts: AtomicI64::new(i64::MIN),
                local_address: Mutex::new(HostPort::new()),
                remote_address: Mutex::new(HostPort::new()),
                last_error: Mutex::new(Ok(())),
                inbuf: Mutex::new(ByteChain::new()),
                outbuf: Mutex::new(ByteChain::new()),
                handlers: Mutex::new(Handlers::default()),
                timeouter,
                close_on_resolve: Mutex::new(None),
                weak_self: weak_self.clone(),
            }
        })
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn last_error(&self) -> Status {
        self.last_error.lock().clone()
    }

    fn set_last_error(&self, status: &Status) {
        if let Err(err) = status {
            if self.params.detail_log {
                debug!("{} - updating error to: {err}", self);
            }
            *self.last_error.lock() = status.clone();
        }
    }

    pub fn read_closed(&self) -> bool {
        self.read_closed.load(Ordering::Acquire)
    }

    pub fn write_closed(&self) -> bool {
        self.write_closed.load(Ordering::Acquire)
    }

    pub fn count_bytes_read(&self) -> i64 {
        self.count_bytes_read.load(Ordering::Relaxed)
    }

    pub fn count_bytes_written(&self) -> i64 {
        self.count_bytes_written.load(Ordering::Relaxed)
    }

    /// Monotonic nanos of the last read event, `i64::MIN` before any.
    pub fn last_read_nanos(&self) -> i64 {
        self.last_read_ts.load(Ordering::Relaxed)
    }

    /// Monotonic nanos of the last write event, `i64::MIN` before any.
    pub fn last_write_nanos(&self) -> i64 {
        self.last_write_ts.load(Ordering::Relaxed)
    }

    /// Buffered input from the peer. Selector-thread access only.
    pub fn inbuf(&self) -> MutexGuard<'_, ByteChain> {
        self.inbuf.lock()
    }

    /// Buffered output for the peer. Selector-thread access only.
    pub fn outbuf(&self) -> MutexGuard<'_, ByteChain> {
        self.outbuf.lock()
    }

    pub fn get_local_address(&self) -> HostPort {
        self.local_address.lock().clone()
    }

    pub fn get_remote_address(&self) -> HostPort {
        self.remote_address.lock().clone()
    }

    // ── Handlers ────────────────────────────────────────────────────

    /// Runs once the connection reaches `Connected`.
    pub fn set_connect_handler(&self, handler: impl FnMut() + Send + 'static) {
        self.handlers.lock().connect = Some(Box::new(handler));
    }

    pub fn clear_connect_handler(&self) {
        self.handlers.lock().connect = None;
    }

    /// Runs after fresh bytes land in the input buffer. An error return
    /// terminates the connection with that status.
    pub fn set_read_handler(&self, handler: impl FnMut() -> Result<()> + Send + 'static) {
        self.handlers.lock().read = Some(Box::new(handler));
    }

    pub fn clear_read_handler(&self) {
        self.handlers.lock().read = None;
    }

    /// Runs when the socket drained output and accepts more.
    pub fn set_write_handler(&self, handler: impl FnMut() -> Result<()> + Send + 'static) {
        self.handlers.lock().write = Some(Box::new(handler));
    }

    pub fn clear_write_handler(&self) {
        self.handlers.lock().write = None;
    }

    /// Runs for half- and full-closes with the terminal status.
    pub fn set_close_handler(
        &self,
        handler: impl FnMut(&Status, CloseDirective) + Send + 'static,
    ) {
        self.handlers.lock().close = Some(Box::new(handler));
    }

    pub fn clear_close_handler(&self) {
        self.handlers.lock().close = None;
    }

    pub fn clear_all_handlers(&self) {
        let mut handlers = self.handlers.lock();
        handlers.connect = None;
        handlers.read = None;
        handlers.write = None;
        handlers.close = None;
    }

    fn call_connect_handler(&self) {
        let taken = self.handlers.lock().connect.take();
        match taken {
            Some(mut connect) => {
                connect();
                let mut handlers = self.handlers.lock();
                if handlers.connect.is_none() {
                    handlers.connect = Some(connect);
                }
            }
            None => warn!("connect handler not set for connection: {}", self),
        }
    }

    fn call_read_handler(&self) -> Result<()> {
        let taken = self.handlers.lock().read.take();
        let Some(mut read) = taken else {
            return Err(Error::FailedPrecondition(format!(
                "no read handler set for connection: {}", self
            )));
        };
        let result = read();
        let mut handlers = self.handlers.lock();
        if handlers.read.is_none() {
            handlers.read = Some(read);
        }
        result
    }

    fn call_write_handler(&self) -> Result<()> {
        let taken = self.handlers.lock().write.take();
        let Some(mut write) = taken else {
            return Err(Error::FailedPrecondition(format!(
                "no write handler set for connection: {}", self
            )));
        };
        let result = write();
        let mut handlers = self.handlers.lock();
        if handlers.write.is_none() {
            handlers.write = Some(write);
        }
        result
    }

    fn call_close_handler(&self, status: &Status, directive: CloseDirective) {
        debug_assert!(
            self.read_closed()
                || !matches!(directive, CloseDirective::Read | CloseDirective::ReadWrite),
            "close handler for read before the read half closed"
        );
        debug_assert!(
            self.write_closed()
                || !matches!(directive, CloseDirective::Write | CloseDirective::ReadWrite),
            "close handler for write before the write half closed"
        );
        let taken = self.handlers.lock().close.take();
        match taken {
            Some(mut close) => {
                close(status, directive);
                let mut handlers = self.handlers.lock();
                if handlers.close.is_none() {
                    handlers.close = Some(close);
                }
            }
            None => {
                if self.params.detail_log {
                    debug!("{} - no close handler set", self);
                }
                self.flush_and_close();
            }
        }
    }

    // ── Connect ─────────────────────────────────────────────────────

    /// Start connecting to `remote_addr`. An unresolved remote first goes
    /// through asynchronous DNS; the connect handler fires on the first
    /// I/O event after the in-progress connect completes. Loop-thread only
    /// once the loop runs.
    pub fn connect(&self, remote_addr: &HostPort) -> Result<()> {
        if self.selector.is_running() && !self.selector.is_in_select_thread() {
            return Err(Error::FailedPrecondition(
                "TcpConnection::connect requires the selector thread".into(),
            ));
        }
        let state = self.state();
        if state != ConnState::Disconnected && state != ConnState::Resolving {
            return Err(Error::FailedPrecondition(format!(
                "connect in illegal state {}",
                state.name()
            )));
        }
        if self.base.fd() != INVALID_FD {
            return Err(Error::FailedPrecondition(
                "connection fd already created".into(),
            ));
        }
        match remote_addr.port() {
            None | Some(0) => {
                return Err(Error::InvalidArgument(format!(
                    "host-port for connect has no port: {remote_addr}"
                )))
            }
            Some(_) => {}
        }

        if state == ConnState::Disconnected && !remote_addr.is_resolved() {
            let Some(host) = remote_addr.host() else {
                return Err(Error::InvalidArgument(format!(
                    "host-port for connect has no host or ip: {remote_addr}"
                )));
            };
            *self.remote_address.lock() = remote_addr.clone();
            if self.params.detail_log {
                debug!("{} - starting DNS resolve", self);
            }
            self.set_state(ConnState::Resolving);
            let weak = self.weak_self.clone();
            let selector = self.selector.clone();
            DnsResolver::default_resolver().resolve_async(host, move |result: DnsResult| {
                // Completion runs on a resolver worker; marshal the result
                // (moved, not borrowed) onto the owning selector.
                selector.run_in_select_loop(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_dns_result(result);
                    }
                });
            });
            return Ok(());
        }

        let (storage, addr_len) = remote_addr.to_sockaddr()?;
        let fd = unsafe {
            libc::socket(storage.ss_family as libc::c_int, libc::SOCK_STREAM, 0)
        };
        if fd < 0 {
            return Err(Error::last_os(format!(
                "::socket failed connecting to {remote_addr}"
            )));
        }
        self.base.set_fd(fd);
        if let Err(err) = self
            .set_socket_options()
            .and_then(|_| self.selector.register(&self.as_selectable()))
        {
            // Nothing registered for sure yet; release the fd directly.
            let fd = self.base.take_fd();
            unsafe {
                libc::close(fd);
            }
            return Err(err);
        }

        self.remote_address.lock().update(remote_addr);
        self.set_state(ConnState::Connecting);
        self.read_closed.store(false, Ordering::Release);
        self.write_closed.store(false, Ordering::Release);

        let ret = unsafe {
            libc::connect(fd, &storage as *const _ as *const libc::sockaddr, addr_len)
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EINPROGRESS {
                // EINPROGRESS is the expected pending case; anything else
                // is a hard failure, rolled back through the close path.
                let err = Error::from_errno(errno, format!("::connect failed for {}", self));
                self.internal_close(Err(err.clone()), false);
                return Err(err);
            }
        }
        // Even an instantly completed connect goes through the first
        // read/write event, keeping one promotion path to Connected.
        if let Err(err) = self
            .request_write_events(true)
            .and_then(|_| self.request_read_events(true))
        {
            self.internal_close(Err(err.clone()), false);
            return Err(err);
        }
        if self.params.detail_log {
            debug!("{} - connecting", self);
        }
        Ok(())
    }

    fn as_selectable(&self) -> Arc<dyn Selectable> {
        self.weak_self.upgrade().expect("connection is alive")
    }

    /// Adopt an already connected fd; how the acceptor initializes the
    /// connections it hands out. Runs on the owning selector thread.
    pub(crate) fn wrap(&self, fd: RawFd) -> Result<()> {
        debug_assert!(
            !self.selector.is_running() || self.selector.is_in_select_thread(),
            "wrap off the selector thread"
        );
        if self.base.fd() != INVALID_FD {
            return Err(Error::FailedPrecondition(
                "wrapping an already connected connection".into(),
            ));
        }
        self.base.set_fd(fd);
        let setup = (|| -> Result<()> {
            self.set_socket_options()?;
            self.selector.register(&self.as_selectable())?;
            self.initialize_local_address()?;
            self.initialize_remote_address()?;
            self.request_read_events(true)
        })();
        if let Err(err) = setup {
            // Caller keeps ownership of the fd on failure.
            if self.base.selector().is_some() {
                let _ = self.selector.unregister(self);
            }
            self.base.take_fd();
            return Err(err);
        }
        self.read_closed.store(false, Ordering::Release);
        self.write_closed.store(false, Ordering::Release);
        self.set_state(ConnState::Connected);
        metrics::CONNECTIONS_ACCEPTED.increment();
        Ok(())
    }

    // ── Writing ─────────────────────────────────────────────────────

    /// Append bytes to the output buffer and request write events.
    /// Loop-thread only, like any desire change.
    pub fn write(&self, data: &[u8]) {
        self.outbuf.lock().append_slice(data);
        if let Err(err) = self.request_write_events(true) {
            warn!("{} - enabling write events failed: {err}", self);
        }
    }

    /// Zero-copy variant of [`write`](Self::write).
    pub fn write_bytes(&self, data: Bytes) {
        self.outbuf.lock().append(data);
        if let Err(err) = self.request_write_events(true) {
            warn!("{} - enabling write events failed: {err}", self);
        }
    }

    // ── Close paths ─────────────────────────────────────────────────

    /// Flush buffered output, half-close, then close when the peer does.
    /// Safe from any thread.
    pub fn flush_and_close(&self) {
        if self.repost(TcpConnection::flush_and_close) {
            return;
        }
        if self.params.detail_log {
            debug!("{} - flush and close", self);
        }
        self.close_communication(CloseDirective::Write);
    }

    /// Tear the connection down immediately. Safe from any thread.
    pub fn force_close(&self) {
        if self.repost(TcpConnection::force_close) {
            return;
        }
        if self.params.detail_log {
            debug!("{} - force close", self);
        }
        self.internal_close(Ok(()), true);
    }

    /// Begin closing the given half. `Read` requests are a no-op; closing
    /// the write half moves a connected connection to `Flushing`, with the
    /// actual `shutdown` issued once the output drains. Safe from any
    /// thread.
    pub fn close_communication(&self, directive: CloseDirective) {
        if self.base.fd() == INVALID_FD {
            debug_assert_eq!(self.state(), ConnState::Disconnected);
            return;
        }
        if self.repost(move |conn| conn.close_communication(directive)) {
            return;
        }
        if self.params.detail_log {
            debug!("{} - close communication: {}", self, directive.name());
        }
        // A remote hang-up may have moved the state to Flushing already;
        // the write interest still has to come back on for the shutdown
        // to be issued.
        if matches!(directive, CloseDirective::Write | CloseDirective::ReadWrite)
            && !self.write_closed()
            && matches!(self.state(), ConnState::Connected | ConnState::Flushing)
        {
            self.set_state(ConnState::Flushing);
            // The write handler issues shutdown(SHUT_WR) when outbuf
            // drains.
            if let Err(err) = self.request_write_events(true) {
                warn!("{} - enabling write events failed: {err}", self);
            }
        }
    }

    /// Run `operation` on the selector thread instead, when called from
    /// outside a live loop. Returns true when reposted.
    fn repost(&self, operation: impl Fn(&TcpConnection) + Send + 'static) -> bool {
        if !self.selector.is_running() || self.selector.is_in_select_thread() {
            return false;
        }
        let weak = self.weak_self.clone();
        self.selector.run_in_select_loop(move || {
            if let Some(conn) = weak.upgrade() {
                operation(&conn);
            }
        });
        true
    }

    // ── Socket options / addresses ──────────────────────────────────

    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        self.setsockopt_int(libc::SOL_SOCKET, libc::SO_SNDBUF, size as libc::c_int, "SO_SNDBUF")
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        self.setsockopt_int(libc::SOL_SOCKET, libc::SO_RCVBUF, size as libc::c_int, "SO_RCVBUF")
    }

    fn setsockopt_int(
        &self,
        level: libc::c_int,
        option: libc::c_int,
        value: libc::c_int,
        name: &str,
    ) -> Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.base.fd(),
                level,
                option,
                &value as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::last_os(format!(
                "::setsockopt {name} failed for {}", self
            )));
        }
        Ok(())
    }

    pub fn request_read_events(&self, enable: bool) -> Result<()> {
        self.selector.enable_read_callback(self, enable)
    }

    pub fn request_write_events(&self, enable: bool) -> Result<()> {
        self.selector.enable_write_callback(self, enable)
    }

    fn set_socket_options(&self) -> Result<()> {
        let fd = self.base.fd();
        debug_assert_ne!(fd, INVALID_FD);
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(Error::last_os(format!("::fcntl F_GETFL failed for {}", self)));
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::last_os(format!("::fcntl F_SETFL failed for {}", self)));
        }
        // Nagle off: this layer already batches through outbuf.
        self.setsockopt_int(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1, "TCP_NODELAY")?;
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        self.setsockopt_int(libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1, "SO_NOSIGPIPE")?;
        if let Some(size) = self.params.send_buffer_size {
            self.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.params.recv_buffer_size {
            self.set_recv_buffer_size(size)?;
        }
        Ok(())
    }

    fn initialize_local_address(&self) -> Result<()> {
        let storage = addr::local_sockaddr(self.base.fd())?;
        let local = HostPort::parse_from_sockaddr(&storage)?;
        self.local_address.lock().update(&local);
        Ok(())
    }

    fn initialize_remote_address(&self) -> Result<()> {
        let storage = addr::peer_sockaddr(self.base.fd())?;
        let remote = HostPort::parse_from_sockaddr(&storage)?;
        self.remote_address.lock().update(&remote);
        Ok(())
    }

    // ── Internal event processing ───────────────────────────────────

    fn handle_timeout_event(&self, timeout_id: TimeoutId) {
        if timeout_id != SHUTDOWN_TIMEOUT_ID {
            warn!("{} - unknown timeout id {timeout_id}", self);
        }
        // The peer never confirmed our half-close within the linger.
        self.internal_close(Ok(()), true);
    }

    fn handle_dns_result(&self, result: DnsResult) {
        if self.state() != ConnState::Resolving {
            debug!("{} - DNS result in state {}, dropped", self, self.state().name());
            return;
        }
        let close_requested = self.close_on_resolve.lock().take();
        if let Some(call_close_handler) = close_requested {
            if self.params.detail_log {
                debug!("{} - resolve completed, but closed in the meantime", self);
            }
            self.set_state(ConnState::Disconnected);
            self.read_closed.store(true, Ordering::Release);
            self.write_closed.store(true, Ordering::Release);
            if call_close_handler {
                self.call_close_handler(&self.last_error(), CloseDirective::ReadWrite);
            }
            self.clear_all_handlers();
            return;
        }
        let status = match result {
            Ok(info) => match info.pick_next_address() {
                Some(ip) => {
                    let connect_addr = {
                        let mut remote = self.remote_address.lock();
                        remote.set_ip(ip);
                        remote.clone()
                    };
                    if self.params.detail_log {
                        debug!("{} - resolve completed: {ip}", self);
                    }
                    self.connect(&connect_addr)
                }
                None => Err(Error::Internal(format!(
                    "no valid IP address resolved for {}", self
                ))),
            },
            Err(err) => Err(err),
        };
        if let Err(err) = status {
            // The failed connect already rolled itself back to
            // Disconnected; surface the terminal status either way.
            self.set_state(ConnState::Disconnected);
            self.read_closed.store(true, Ordering::Release);
            self.write_closed.store(true, Ordering::Release);
            self.set_last_error(&Err(err.clone()));
            self.call_close_handler(&Err(err), CloseDirective::ReadWrite);
            self.clear_all_handlers();
        }
    }

    /// Promote `Connecting` to `Connected` on the first I/O event and run
    /// the connect handler.
    fn perform_connect_on_first_operation(&self) -> bool {
        self.set_state(ConnState::Connected);
        if let Err(err) = self.initialize_local_address() {
            warn!("{} - initializing local address on connect: {err}", self);
        }
        self.call_connect_handler();
        debug_assert!(
            matches!(
                self.state(),
                ConnState::Connected | ConnState::Disconnected | ConnState::Flushing
            ),
            "connect handler left an invalid state"
        );
        if self.params.detail_log {
            debug!("{} - connected", self);
        }
        self.state() == ConnState::Connected
    }

    /// One buffered read: query FIONREAD, cap, read, account. Returns the
    /// byte count and whether the kernel reported end-of-stream.
    fn perform_read(&self) -> Result<(usize, bool)> {
        let fd = self.base.fd();
        let mut available: libc::c_int = 0;
        if unsafe { libc::ioctl(fd, libc::FIONREAD as _, &mut available) } < 0 {
            return Err(Error::last_os(format!(
                "::ioctl FIONREAD failed for {}", self
            )));
        }
        // A readable socket with nothing to read is the peer's EOF.
        if available <= 0 {
            return Ok((0, true));
        }
        let mut count = available as usize;
        if let Some(limit) = self.params.read_limit {
            count = count.min(limit);
        }
        // Consume everything budgeted, allocating block_size at a time.
        let block_size = self.params.block_size.max(1);
        let read = {
            let mut inbuf = self.inbuf.lock();
            let mut total = 0usize;
            while total < count {
                let chunk = (count - total).min(block_size);
                let cb = selectable::read_to_chain(fd, &mut inbuf, chunk)?;
                total += cb;
                if cb < chunk {
                    break;
                }
            }
            total
        };
        if read > 0 {
            self.count_bytes_read.fetch_add(read as i64, Ordering::Relaxed);
            self.last_read_ts
                .store(self.selector.now_nanos(), Ordering::Relaxed);
            metrics::BYTES_RECEIVED.add(read as u64);
        }
        Ok((read, false))
    }

    fn internal_close(&self, status: Status, call_close_handler: bool) {
        if self.state() == ConnState::Disconnected {
            debug_assert_eq!(self.base.fd(), INVALID_FD);
            return;
        }
        self.set_last_error(&status);
        if self.state() == ConnState::Resolving {
            if self.params.detail_log {
                debug!("{} - close delayed until the resolve completes", self);
            }
            *self.close_on_resolve.lock() = Some(call_close_handler);
            return;
        }
        if self.base.fd() != INVALID_FD {
            if let Err(err) = self.selector.unregister(self) {
                warn!("{} - unregistering connection failed: {err}", self);
            }
            let fd = self.base.take_fd();
            if unsafe { libc::shutdown(fd, libc::SHUT_RDWR) } < 0 {
                let err = std::io::Error::last_os_error();
                // ENOTCONN is routine here: the peer may be gone already.
                if err.raw_os_error() != Some(libc::ENOTCONN) {
                    warn!("{} - ::shutdown failed: {err}", self);
                }
            }
            if unsafe { libc::close(fd) } < 0 {
                warn!("{} - ::close failed", self);
            }
        }
        self.set_state(ConnState::Disconnected);
        self.read_closed.store(true, Ordering::Release);
        self.write_closed.store(true, Ordering::Release);
        self.timeouter.clear_all_timeouts();
        {
            let mut inbuf = self.inbuf.lock();
            if !inbuf.is_empty() {
                warn!("{} - closed with {} unread input bytes", self, inbuf.len());
                inbuf.clear();
            }
        }
        {
            let mut outbuf = self.outbuf.lock();
            if !outbuf.is_empty() {
                warn!("{} - closed with {} unwritten output bytes", self, outbuf.len());
                outbuf.clear();
            }
        }
        metrics::CONNECTIONS_CLOSED.increment();
        if call_close_handler {
            self.call_close_handler(&status, CloseDirective::ReadWrite);
            // The connection is finished; dropping the handlers releases
            // any application captures referencing it. A silent close
            // keeps them: the caller still owes the application its
            // terminal notification.
            self.clear_all_handlers();
        }
    }
}

impl Selectable for TcpConnection {
    fn base(&self) -> &SelectableBase {
        &self.base
    }

    fn handle_read_event(&self, _event: SelectorEvent) -> bool {
        debug_assert!(self.selector.is_in_select_thread());
        if self.state() == ConnState::Connecting {
            return self.perform_connect_on_first_operation();
        }
        if !matches!(self.state(), ConnState::Connected | ConnState::Flushing) {
            warn!("{} - read event in state {}", self, self.state().name());
            return false;
        }
        let (read, eof) = match self.perform_read() {
            Ok(outcome) => outcome,
            Err(err) => {
                self.internal_close(Err(err), true);
                return false;
            }
        };
        if read > 0 {
            if let Err(err) = self.call_read_handler() {
                self.internal_close(Err(err), true);
                return false;
            }
        }
        if eof || self.write_closed() || self.state() == ConnState::Flushing {
            self.read_closed.store(true, Ordering::Release);
        }
        if self.read_closed() {
            self.call_close_handler(&Ok(()), CloseDirective::Read);
            if self.base.fd() != INVALID_FD {
                // Level-triggered readiness keeps firing for a half-closed
                // read side; drop the interest. The application decides
                // whether to shut down the write half too.
                if let Err(err) = self.request_read_events(false) {
                    self.internal_close(Err(err), true);
                    return false;
                }
            }
        }
        true
    }

    fn handle_write_event(&self, _event: SelectorEvent) -> bool {
        debug_assert!(self.selector.is_in_select_thread());
        if self.state() == ConnState::Connecting {
            return self.perform_connect_on_first_operation();
        }
        if !matches!(self.state(), ConnState::Connected | ConnState::Flushing) {
            warn!("{} - write event in state {}", self, self.state().name());
            return false;
        }

        let written = {
            let mut outbuf = self.outbuf.lock();
            match selectable::write_chain_vectored(
                self.base.fd(),
                &outbuf,
                self.params.write_limit,
            ) {
                Ok(written) => {
                    outbuf.drop_front(written);
                    written
                }
                Err(err) => {
                    drop(outbuf);
                    self.internal_close(Err(err), true);
                    return false;
                }
            }
        };
        if written > 0 {
            self.count_bytes_written
                .fetch_add(written as i64, Ordering::Relaxed);
            self.last_write_ts
                .store(self.selector.now_nanos(), Ordering::Relaxed);
            metrics::BYTES_SENT.add(written as u64);
        }

        if self.state() != ConnState::Flushing {
            if let Err(err) = self.call_write_handler() {
                self.internal_close(Err(err), true);
                return false;
            }
        }
        if !self.outbuf.lock().is_empty() {
            // More to send; stay write-interested.
            return true;
        }
        if let Err(err) = self.request_write_events(false) {
            self.internal_close(Err(err), true);
            return false;
        }
        if self.state() != ConnState::Flushing {
            return true;
        }
        if self.write_closed() {
            // The half-close went out already; nothing left to flush.
            return true;
        }
        // Flushing and drained: issue the half-close and start the linger
        // clock. The peer's close shows up as a HUP.
        if unsafe { libc::shutdown(self.base.fd(), libc::SHUT_WR) } < 0 {
            self.internal_close(
                Err(Error::last_os(format!(
                    "::shutdown after flush failed for {}", self
                ))),
                true,
            );
            return false;
        }
        self.write_closed.store(true, Ordering::Release);
        self.timeouter
            .set_timeout(SHUTDOWN_TIMEOUT_ID, self.params.shutdown_linger_timeout);
        true
    }

    fn handle_error_event(&self, event: SelectorEvent) -> bool {
        debug_assert!(self.selector.is_in_select_thread());
        debug_assert_ne!(self.state(), ConnState::Disconnected);
        let raw = event.raw;

        if self.selector.is_error_event(raw) {
            let errno = extract_socket_errno(self.base.fd());
            self.internal_close(
                Err(Error::from_errno(
                    errno,
                    format!("error on connection socket for {}", self),
                )),
                true,
            );
            return false;
        }
        // HUP: the peer is gone entirely. RDHUP: the peer half-closed and
        // still reads. Either way pending input is drained first when the
        // event also signals readability.
        if self.selector.is_hang_up_event(raw) {
            self.write_closed.store(true, Ordering::Release);
            if self.state() != ConnState::Connecting && self.selector.is_input_event(raw) {
                if self.params.detail_log {
                    debug!("{} - HUP with pending input, draining", self);
                }
                return true;
            }
            if self.params.detail_log {
                debug!("{} - HUP, closing", self);
            }
            self.internal_close(Ok(()), true);
            return false;
        }
        if self.selector.is_remote_hang_up_event(raw) {
            if self.state() == ConnState::Connected {
                self.set_state(ConnState::Flushing);
            }
            if self.state() != ConnState::Connecting && self.selector.is_input_event(raw) {
                if self.params.detail_log {
                    debug!("{} - remote HUP with pending input, draining", self);
                }
                return true;
            }
            if self.params.detail_log {
                debug!("{} - remote HUP, closing", self);
            }
            self.internal_close(Ok(()), true);
            return false;
        }
        true
    }

    fn close(&self) {
        if self.params.detail_log {
            debug!("{} - external close requested", self);
        }
        self.internal_close(Ok(()), true);
    }
}

impl fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TcpConnection [ {} => {} (fd: {}, state: {}) ]",
            self.get_local_address(),
            self.get_remote_address(),
            self.base.fd(),
            self.state().name()
        )
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.state(),
            ConnState::Disconnected,
            "only disconnected connections may be dropped"
        );
        let fd = self.base.take_fd();
        if fd != INVALID_FD {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectorParams;

    #[test]
    fn state_names() {
        assert_eq!(ConnState::Disconnected.name(), "DISCONNECTED");
        assert_eq!(ConnState::Flushing.name(), "FLUSHING");
        assert_eq!(CloseDirective::ReadWrite.name(), "CLOSE_READ_WRITE");
    }

    #[test]
    fn connect_rejects_missing_port() {
        let selector = Selector::new(SelectorParams::default()).unwrap();
        let conn = TcpConnection::new(selector, TcpConnectionParams::default());
        let no_port = HostPort::parse_from_string("[::1]").unwrap();
        assert!(matches!(
            conn.connect(&no_port),
            Err(Error::InvalidArgument(_))
        ));
        let mut zero_port = HostPort::new();
        zero_port.set_ip(crate::addr::IpAddress::IPV4_LOOPBACK);
        zero_port.set_port(0);
        assert!(matches!(
            conn.connect(&zero_port),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(conn.state(), ConnState::Disconnected);
    }

    #[test]
    fn connect_rejects_empty_hostport() {
        let selector = Selector::new(SelectorParams::default()).unwrap();
        let conn = TcpConnection::new(selector, TcpConnectionParams::default());
        let mut addr = HostPort::new();
        addr.set_port(4000);
        assert!(matches!(
            conn.connect(&addr),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn new_connection_is_disconnected() {
        let selector = Selector::new(SelectorParams::default()).unwrap();
        let conn = TcpConnection::new(selector, TcpConnectionParams::default());
        assert_eq!(conn.state(), ConnState::Disconnected);
        assert_eq!(conn.count_bytes_read(), 0);
        assert_eq!(conn.count_bytes_written(), 0);
        assert!(!conn.read_closed());
        assert!(!conn.write_closed());
        assert!(conn.last_error().is_ok());
    }
}
