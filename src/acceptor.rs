//! Listening socket management: accept, filter, and hand new connections
//! off to a pool of selector threads.

use std::fmt;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::addr::{self, HostPort};
use crate::config::TcpAcceptorParams;
use crate::connection::{extract_socket_errno, TcpConnection};
use crate::error::{Error, Result, Status};
use crate::event::{SelectorEvent, INVALID_FD};
use crate::metrics;
use crate::selectable::{Selectable, SelectableBase};
use crate::selector::Selector;

/// Acceptor lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AcceptorState {
    Disconnected = 0,
    Listening = 1,
}

impl AcceptorState {
    fn from_u8(value: u8) -> AcceptorState {
        match value {
            1 => AcceptorState::Listening,
            _ => AcceptorState::Disconnected,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AcceptorState::Disconnected => "DISCONNECTED",
            AcceptorState::Listening => "LISTENING",
        }
    }
}

/// The selector pool accepted connections are distributed over,
/// round-robin. An empty pool sends everything to the acceptor's own
/// selector.
#[derive(Default)]
pub struct AcceptorThreads {
    next: AtomicUsize,
    selectors: Vec<Arc<Selector>>,
}

impl AcceptorThreads {
    pub fn new(selectors: Vec<Arc<Selector>>) -> Self {
        AcceptorThreads {
            next: AtomicUsize::new(0),
            selectors,
        }
    }

    pub fn set_selectors(mut self, selectors: Vec<Arc<Selector>>) -> Self {
        self.selectors = selectors;
        self
    }

    /// The next selector in rotation, `None` for an empty pool.
    pub fn next_selector(&self) -> Option<Arc<Selector>> {
        if self.selectors.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.selectors.len();
        Some(self.selectors[index].clone())
    }
}

impl Clone for AcceptorThreads {
    fn clone(&self) -> Self {
        AcceptorThreads {
            next: AtomicUsize::new(self.next.load(Ordering::Relaxed)),
            selectors: self.selectors.clone(),
        }
    }
}

/// Counters describing an acceptor's run.
#[derive(Default)]
pub struct AcceptorStats {
    /// Hang-ups received on the listening socket.
    hang_ups_handled: AtomicUsize,
    /// Errors received on the listening socket; at most 1, since errors
    /// close the acceptor.
    errors_handled: AtomicUsize,
    /// Peer addresses that failed to parse.
    peer_parse_errors: AtomicUsize,
    /// Connections rejected by the filter handler.
    filtered_connections: AtomicUsize,
    /// Accepted fds scheduled for initialization on a selector.
    connections_accept_scheduled: AtomicUsize,
    /// Initializations that actually started.
    connections_accepted: AtomicUsize,
    /// Accepted fds whose connection wrapping failed.
    connection_wrap_errors: AtomicUsize,
    /// Fully initialized connections handed to the application.
    connections_initialized: AtomicUsize,
}

macro_rules! stat_accessor {
    ($name:ident) => {
        pub fn $name(&self) -> usize {
            self.$name.load(Ordering::Relaxed)
        }
    };
}

impl AcceptorStats {
    stat_accessor!(hang_ups_handled);
    stat_accessor!(errors_handled);
    stat_accessor!(peer_parse_errors);
    stat_accessor!(filtered_connections);
    stat_accessor!(connections_accept_scheduled);
    stat_accessor!(connections_accepted);
    stat_accessor!(connection_wrap_errors);
    stat_accessor!(connections_initialized);
}

type FilterHandler = Box<dyn FnMut(&HostPort) -> bool + Send>;
type AcceptHandler = Box<dyn FnMut(Arc<TcpConnection>) + Send>;
type CloseHandler = Box<dyn FnMut(&Status) + Send>;

#[derive(Default)]
struct AcceptorHandlers {
    filter: Option<FilterHandler>,
    accept: Option<AcceptHandler>,
    close: Option<CloseHandler>,
}

/// A listening TCP socket driving connection hand-off.
///
/// Lifecycle: `Disconnected → listen() → Listening → close() →
/// Disconnected`. All event processing happens on the owning selector
/// thread; [`close`](TcpAcceptor::close) may be called from anywhere.
pub struct TcpAcceptor {
    base: SelectableBase,
    selector: Arc<Selector>,
    params: TcpAcceptorParams,
    state: AtomicU8,
    local_address: Mutex<HostPort>,
    last_error: Mutex<Status>,
    handlers: Mutex<AcceptorHandlers>,
    stats: AcceptorStats,
    weak_self: std::sync::Weak<TcpAcceptor>,
}

impl TcpAcceptor {
    pub fn new(selector: Arc<Selector>, params: TcpAcceptorParams) -> Arc<TcpAcceptor> {
        Arc::new_cyclic(|weak_self| TcpAcceptor {
            base: SelectableBase::new(),
            selector,
            params,
            state: AtomicU8::new(AcceptorState::Disconnected as u8),
            local_address: Mutex::new(HostPort::new()),
            last_error: Mutex::new(Ok(())),
            handlers: Mutex::new(AcceptorHandlers::default()),
            stats: AcceptorStats::default(),
            weak_self: weak_self.clone(),
        })
    }

    fn as_selectable(&self) -> Arc<dyn Selectable> {
        self.weak_self.upgrade().expect("acceptor is alive")
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn state(&self) -> AcceptorState {
        AcceptorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: AcceptorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The address we listen on; with a requested port of 0 this carries
    /// the port the system picked.
    pub fn local_address(&self) -> HostPort {
        self.local_address.lock().clone()
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

    pub fn stats(&self) -> &AcceptorStats {
        &self.stats
    }

    // ── Handlers ────────────────────────────────────────────────────

    /// The filter decides per peer address whether setup proceeds.
    pub fn set_filter_handler(&self, handler: impl FnMut(&HostPort) -> bool + Send + 'static) {
        self.handlers.lock().filter = Some(Box::new(handler));
    }

    pub fn clear_filter_handler(&self) {
        self.handlers.lock().filter = None;
    }

    /// Receives every fully connected client. Without one, new
    /// connections are dropped.
    pub fn set_accept_handler(&self, handler: impl FnMut(Arc<TcpConnection>) + Send + 'static) {
        self.handlers.lock().accept = Some(Box::new(handler));
    }

    pub fn clear_accept_handler(&self) {
        self.handlers.lock().accept = None;
    }

    /// Runs when the listening socket closes because of an error.
    pub fn set_close_handler(&self, handler: impl FnMut(&Status) + Send + 'static) {
        self.handlers.lock().close = Some(Box::new(handler));
    }

    pub fn clear_close_handler(&self) {
        self.handlers.lock().close = None;
    }

    fn call_filter_handler(&self, peer_address: &HostPort) -> bool {
        let mut handlers = self.handlers.lock();
        match handlers.filter.as_mut() {
            Some(filter) => filter(peer_address),
            None => true,
        }
    }

    fn call_close_handler(&self, status: &Status) {
        let taken = self.handlers.lock().close.take();
        if let Some(mut close) = taken {
            close(status);
            let mut handlers = self.handlers.lock();
            if handlers.close.is_none() {
                handlers.close = Some(close);
            }
        }
    }

    // ── Listen / close ──────────────────────────────────────────────

    /// Bind and listen on `local_addr`, registering with the selector.
    /// The address needs an ip; a missing or zero port asks the system to
    /// pick one, readable afterwards through
    /// [`local_address`](Self::local_address).
    pub fn listen(self: &Arc<Self>, local_addr: &HostPort) -> Result<()> {
        if self.base.fd() != INVALID_FD {
            return Err(Error::FailedPrecondition(format!(
                "{} - listening again with a live socket", self
            )));
        }
        if self.state() != AcceptorState::Disconnected {
            return Err(Error::FailedPrecondition(format!(
                "{} - listening on a non-disconnected acceptor", self
            )));
        }
        let ip = local_addr.ip().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "listen address has no ip: {local_addr}"
            ))
        })?;
        let (storage, addr_len) =
            addr::to_sockaddr_parts(ip, local_addr.port().unwrap_or(0), local_addr.scope_id());

        let fd = unsafe {
            libc::socket(storage.ss_family as libc::c_int, libc::SOCK_STREAM, 0)
        };
        if fd < 0 {
            return Err(Error::last_os(format!("::socket failed for {}", self)));
        }
        self.base.set_fd(fd);
        if let Err(err) = self.listen_with_fd(fd, &storage, addr_len) {
            if self.base.selector().is_some() {
                if let Err(unregister_err) = self.selector.unregister(&**self) {
                    warn!("{} - unregistering after listen error: {unregister_err}", self);
                }
            }
            self.base.set_fd(INVALID_FD);
            if unsafe { libc::close(fd) } < 0 {
                warn!("{} - ::close failed after listen error", self);
            }
            self.set_last_error(&Err(err.clone()));
            return Err(err);
        }
        self.set_state(AcceptorState::Listening);
        if self.params.detail_log {
            debug!("{} - bound and listening", self);
        }
        Ok(())
    }

    fn listen_with_fd(
        self: &Arc<Self>,
        fd: RawFd,
        storage: &libc::sockaddr_storage,
        addr_len: libc::socklen_t,
    ) -> Result<()> {
        self.set_socket_options(fd)?;
        let ret = unsafe {
            libc::bind(fd, storage as *const _ as *const libc::sockaddr, addr_len)
        };
        if ret < 0 {
            return Err(Error::last_os(format!("::bind failed for {}", self)));
        }
        if unsafe { libc::listen(fd, self.params.max_backlog as libc::c_int) } < 0 {
            return Err(Error::last_os(format!("::listen failed for {}", self)));
        }
        self.selector.register(&self.as_selectable())?;
        // Port 0 binds get their actual port from the socket.
        self.initialize_local_address()
    }

    fn set_socket_options(&self, fd: RawFd) -> Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(Error::last_os(format!("::fcntl F_GETFL failed for {}", self)));
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::last_os(format!("::fcntl F_SETFL failed for {}", self)));
        }
        let true_flag: libc::c_int = 1;
        // Without SO_REUSEADDR a restart inside TIME_WAIT fails its bind
        // with EADDRINUSE.
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &true_flag as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::last_os(format!(
                "::setsockopt SO_REUSEADDR failed for {}", self
            )));
        }
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        {
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_NOSIGPIPE,
                    &true_flag as *const _ as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(Error::last_os(format!(
                    "::setsockopt SO_NOSIGPIPE failed for {}", self
                )));
            }
        }
        Ok(())
    }

    fn initialize_local_address(&self) -> Result<()> {
        let storage = addr::local_sockaddr(self.base.fd())?;
        let local = HostPort::parse_from_sockaddr(&storage)?;
        self.local_address.lock().update(&local);
        Ok(())
    }

    /// Close the acceptor. Safe from any thread; reposted into the loop
    /// when needed.
    pub fn close(&self) {
        if self.selector.is_running() && !self.selector.is_in_select_thread() {
            if let Some(this) = self.weak_self.upgrade() {
                self.selector.run_in_select_loop(move || this.close());
            }
            return;
        }
        if self.params.detail_log {
            debug!("{} - closing acceptor", self);
        }
        self.internal_close(Ok(()));
    }

    fn internal_close(&self, status: Status) {
        self.set_last_error(&status);
        if self.base.fd() == INVALID_FD {
            debug_assert_eq!(self.state(), AcceptorState::Disconnected);
            return;
        }
        if let Err(err) = self.selector.unregister(self) {
            warn!("{} - unregistering acceptor failed: {err}", self);
        }
        let fd = self.base.take_fd();
        if unsafe { libc::close(fd) } < 0 {
            warn!("{} - ::close failed", self);
        }
        self.set_state(AcceptorState::Disconnected);
        self.call_close_handler(&status);
    }

    // ── Accepted-connection hand-off ────────────────────────────────

    fn initialize_accepted_connection(
        self: &Arc<Self>,
        net_selector: &Arc<Selector>,
        client_fd: RawFd,
    ) {
        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        let client = TcpConnection::new(
            net_selector.clone(),
            self.params.tcp_connection_params.clone(),
        );
        if let Err(err) = client.wrap(client_fd) {
            self.stats
                .connection_wrap_errors
                .fetch_add(1, Ordering::Relaxed);
            warn!("failed to wrap incoming client fd {client_fd}: {err}");
            if unsafe { libc::close(client_fd) } < 0 {
                warn!("{} - ::close failed on unwrapped client fd", self);
            }
            return;
        }
        self.stats
            .connections_initialized
            .fetch_add(1, Ordering::Relaxed);
        if self.params.detail_log {
            debug!("{} - incoming connection accepted: {client}", self);
        }
        let taken = self.handlers.lock().accept.take();
        match taken {
            Some(mut accept) => {
                accept(client);
                let mut handlers = self.handlers.lock();
                if handlers.accept.is_none() {
                    handlers.accept = Some(accept);
                }
            }
            None => {
                warn!("{} - no accept handler, dropping connection {client}", self);
                client.force_close();
            }
        }
    }
}

impl Selectable for TcpAcceptor {
    fn base(&self) -> &SelectableBase {
        &self.base
    }

    fn handle_read_event(&self, _event: SelectorEvent) -> bool {
        debug_assert!(self.selector.is_in_select_thread());
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let client_fd = unsafe {
            libc::accept(
                self.base.fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if client_fd < 0 {
            let err = std::io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)) {
                // The connecting client went away before our accept.
                return true;
            }
            let status = Error::last_os(format!("::accept failed for {}", self));
            warn!("{} - {status}; closing acceptor", self);
            self.internal_close(Err(status));
            return false;
        }

        let peer_address = match HostPort::parse_from_sockaddr(&storage) {
            Ok(peer) => peer,
            Err(err) => {
                warn!("cannot parse peer address from sockaddr: {err} - closing connection");
                self.stats.peer_parse_errors.fetch_add(1, Ordering::Relaxed);
                unsafe {
                    libc::close(client_fd);
                }
                return true;
            }
        };
        if !self.call_filter_handler(&peer_address) {
            if self.params.detail_log {
                debug!("{} - connection filtered out: {peer_address}", self);
            }
            self.stats
                .filtered_connections
                .fetch_add(1, Ordering::Relaxed);
            metrics::CONNECTIONS_FILTERED.increment();
            unsafe {
                libc::close(client_fd);
            }
            return true;
        }
        self.stats
            .connections_accept_scheduled
            .fetch_add(1, Ordering::Relaxed);
        if self.params.detail_log {
            debug!("{} - connection accepted from {peer_address}", self);
        }

        let Some(this) = self.weak_self.upgrade() else {
            unsafe {
                libc::close(client_fd);
            }
            return false;
        };
        match self.params.acceptor_threads.next_selector() {
            Some(target) => {
                // Initialization must run on the selector that will own
                // the connection.
                let net_selector = target.clone();
                target.run_in_select_loop(move || {
                    this.initialize_accepted_connection(&net_selector, client_fd);
                });
            }
            None => {
                this.initialize_accepted_connection(&self.selector, client_fd);
            }
        }
        true
    }

    fn handle_write_event(&self, _event: SelectorEvent) -> bool {
        debug_assert!(self.selector.is_in_select_thread());
        warn!("{} - write event on a listening socket", self);
        false
    }

    fn handle_error_event(&self, event: SelectorEvent) -> bool {
        debug_assert!(self.selector.is_in_select_thread());
        if self.selector.is_any_hang_up_event(event.raw) {
            if self.params.detail_log {
                debug!("{} - hang up event on the listening socket", self);
            }
            self.stats.hang_ups_handled.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if self.selector.is_error_event(event.raw) {
            let errno = extract_socket_errno(self.base.fd());
            self.stats.errors_handled.fetch_add(1, Ordering::Relaxed);
            self.internal_close(Err(Error::from_errno(
                errno,
                format!("error on the listening socket of {}", self),
            )));
            return false;
        }
        true
    }

    fn close(&self) {
        self.internal_close(Ok(()));
    }
}

impl fmt::Display for TcpAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TcpAcceptor [ {} state: {} fd: {} ]",
            self.local_address(),
            self.state().name(),
            self.base.fd()
        )
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.state(),
            AcceptorState::Disconnected,
            "only disconnected acceptors may be dropped"
        );
        let fd = self.base.take_fd();
        if fd != INVALID_FD {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
