//! wireline — a reactor-based TCP/TLS networking core for Unix.
//!
//! wireline multiplexes non-blocking sockets on per-thread event reactors
//! ([`Selector`]s) over epoll or poll. Applications register I/O objects
//! and timed callbacks with a reactor; the reactor drives connection state
//! machines (resolve → connect → connected → flushing → disconnected) and
//! delivers bytes through chained buffers with backpressure. Cross-thread
//! work enters a reactor through its deferred-task queue; name resolution
//! runs on a worker pool fed by a lock-free bounded queue.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wireline::{HostPort, IpAddress, SelectorThread, SelectorParams,
//!                TcpAcceptor, TcpAcceptorParams};
//!
//! fn main() -> wireline::Result<()> {
//!     let thread = Arc::new(SelectorThread::new(SelectorParams::default())?);
//!
//!     let acceptor = TcpAcceptor::new(thread.selector().clone(),
//!                                     TcpAcceptorParams::default());
//!     acceptor.set_accept_handler(|conn| {
//!         let echo = conn.clone();
//!         conn.set_read_handler(move || {
//!             let data = echo.inbuf().take_all();
//!             echo.write_bytes(data);
//!             Ok(())
//!         });
//!         conn.set_write_handler(|| Ok(()));
//!         conn.set_close_handler(|_status, _directive| {});
//!     });
//!
//!     let mut local = HostPort::new();
//!     local.set_ip(IpAddress::IPV4_LOOPBACK).set_port(7878);
//!     acceptor.listen(&local)?;
//!
//!     thread.start();
//!     // ... serve until shutdown ...
//!     acceptor.close();
//!     thread.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Threading model
//!
//! Each reactor is a single-threaded cooperative scheduler; a connection
//! or acceptor is pinned to exactly one reactor for its active lifetime
//! and all of its handlers run there. Registration and desire changes are
//! loop-thread-only; `run_in_select_loop`, alarms and `make_loop_exit`
//! are safe from any thread.
//!
//! # Platform
//!
//! Unix only. The epoll backend and eventfd wake-up need Linux; the poll
//! backend and self-pipe work everywhere else.

// ── Internal modules ────────────────────────────────────────────────────
pub mod counter;
pub(crate) mod poller;

// ── Public modules ──────────────────────────────────────────────────────
pub mod acceptor;
pub mod addr;
pub mod chain;
pub mod config;
pub mod connection;
pub mod dns;
pub mod error;
pub mod event;
pub mod metrics;
pub mod queue;
pub mod selectable;
pub mod selector;
pub mod timeouter;
#[cfg(feature = "tls")]
pub mod tls;

// ── Re-exports: addresses ───────────────────────────────────────────────

/// A 16-byte IP value; IPv4 stored as IPv4-mapped IPv6.
pub use addr::IpAddress;
/// A host/ip/port tuple with canonical text forms.
pub use addr::HostPort;

// ── Re-exports: buffers and queues ──────────────────────────────────────

/// Append-only rope of byte segments used for connection I/O.
pub use chain::ByteChain;
/// Lock-free bounded multi-producer / multi-consumer queue.
pub use queue::MpmcQueue;

// ── Re-exports: reactor ─────────────────────────────────────────────────

/// Alarm identifier returned by [`Selector::register_alarm`].
pub use selector::AlarmId;
/// The event reactor.
pub use selector::Selector;
/// A reactor wrapped in an OS thread.
pub use selector::SelectorThread;
/// Deferred task posted to a reactor.
pub use selector::Task;
/// Capability implemented by everything a reactor multiplexes.
pub use selectable::Selectable;
/// Shared bookkeeping embedded by [`Selectable`] implementors.
pub use selectable::SelectableBase;
/// One readiness event delivered to a [`Selectable`].
pub use event::SelectorEvent;
/// Sentinel for "no file descriptor".
pub use event::INVALID_FD;
/// Per-owner named timeouts over reactor alarms.
pub use timeouter::Timeouter;
/// Caller-chosen timeout identifier.
pub use timeouter::TimeoutId;

// ── Re-exports: TCP ─────────────────────────────────────────────────────

/// Round-robin pool of reactors receiving accepted connections.
pub use acceptor::AcceptorThreads;
/// Acceptor statistics counters.
pub use acceptor::AcceptorStats;
/// Acceptor lifecycle state.
pub use acceptor::AcceptorState;
/// The listening TCP socket.
pub use acceptor::TcpAcceptor;
/// Which half of a connection a close concerns.
pub use connection::CloseDirective;
/// Connection lifecycle state.
pub use connection::ConnState;
/// The non-blocking TCP connection.
pub use connection::TcpConnection;

// ── Re-exports: DNS ─────────────────────────────────────────────────────

/// The addresses resolved for one host name.
pub use dns::DnsHostInfo;
/// Thread-pool name resolver.
pub use dns::DnsResolver;
/// Resolution outcome passed to callers and callbacks.
pub use dns::DnsResult;

// ── Re-exports: configuration ───────────────────────────────────────────

/// DNS resolver configuration.
pub use config::DnsResolverOptions;
/// MPMC queue configuration.
pub use config::MpmcQueueParams;
/// Reactor configuration.
pub use config::SelectorParams;
/// Acceptor configuration.
pub use config::TcpAcceptorParams;
/// Connection configuration.
pub use config::TcpConnectionParams;

// ── Re-exports: errors ──────────────────────────────────────────────────

/// Error kinds for every wireline operation.
pub use error::Error;
/// Crate-wide result alias.
pub use error::Result;
/// Terminal status delivered to close handlers.
pub use error::Status;

// ── Re-exports: TLS (feature-gated) ─────────────────────────────────────

/// TLS acceptor wrapping a [`TcpAcceptor`].
#[cfg(feature = "tls")]
pub use tls::TlsAcceptor;
/// TLS acceptor configuration.
#[cfg(feature = "tls")]
pub use tls::TlsAcceptorParams;
/// TLS connection wrapping a [`TcpConnection`].
#[cfg(feature = "tls")]
pub use tls::TlsConnection;
/// TLS connection configuration.
#[cfg(feature = "tls")]
pub use tls::TlsConnectionParams;
