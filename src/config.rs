//! Configuration for selectors, connections, acceptors, the DNS resolver
//! and the MPMC queue. Every struct has chained setters so call sites read
//! as a single expression.

use std::time::Duration;

use crate::acceptor::AcceptorThreads;

/// Configuration for a [`Selector`](crate::Selector).
#[derive(Clone, Debug)]
pub struct SelectorParams {
    /// Maximum number of kernel I/O events to accept per loop step.
    pub max_events_per_step: usize,
    /// Maximum number of deferred callbacks to run per loop step.
    pub max_callbacks_per_event: usize,
    /// Wall-clock budget for one batch of deferred callbacks; callbacks
    /// left over stay queued for the next step.
    pub callbacks_timeout_per_event: Duration,
    /// Default timeout to break an epoll/poll wait when nothing happens.
    pub default_loop_timeout: Duration,
    /// Use the Linux `eventfd` API for cross-thread wake-up, a self-pipe
    /// otherwise.
    pub use_event_fd: bool,
    /// Use epoll for the loop backend (as opposed to poll).
    pub use_epoll: bool,
}

impl Default for SelectorParams {
    fn default() -> Self {
        Self {
            max_events_per_step: 128,
            max_callbacks_per_event: 64,
            callbacks_timeout_per_event: Duration::from_secs(1),
            default_loop_timeout: Duration::from_secs(1),
            use_event_fd: cfg!(target_os = "linux"),
            use_epoll: cfg!(target_os = "linux"),
        }
    }
}

impl SelectorParams {
    pub fn set_max_events_per_step(mut self, value: usize) -> Self {
        self.max_events_per_step = value;
        self
    }
    pub fn set_max_callbacks_per_event(mut self, value: usize) -> Self {
        self.max_callbacks_per_event = value;
        self
    }
    pub fn set_callbacks_timeout_per_event(mut self, value: Duration) -> Self {
        self.callbacks_timeout_per_event = value;
        self
    }
    pub fn set_default_loop_timeout(mut self, value: Duration) -> Self {
        self.default_loop_timeout = value;
        self
    }
    pub fn set_use_event_fd(mut self, value: bool) -> Self {
        self.use_event_fd = value;
        self
    }
    pub fn set_use_epoll(mut self, value: bool) -> Self {
        self.use_epoll = value;
        self
    }
}

/// Configuration for a [`TcpConnection`](crate::TcpConnection).
#[derive(Clone, Debug)]
pub struct TcpConnectionParams {
    /// `SO_SNDBUF` for the underlying socket, when set.
    pub send_buffer_size: Option<usize>,
    /// `SO_RCVBUF` for the underlying socket, when set.
    pub recv_buffer_size: Option<usize>,
    /// Cap on the bytes consumed by one read event.
    pub read_limit: Option<usize>,
    /// Cap on the bytes emitted by one write event.
    pub write_limit: Option<usize>,
    /// Allocation block size for buffered reads.
    pub block_size: usize,
    /// How long a flushing connection lingers after its half-close before
    /// being force-closed.
    pub shutdown_linger_timeout: Duration,
    /// Emit per-connection debug logs.
    pub detail_log: bool,
}

impl Default for TcpConnectionParams {
    fn default() -> Self {
        Self {
            send_buffer_size: None,
            recv_buffer_size: None,
            read_limit: None,
            write_limit: None,
            block_size: 16384,
            shutdown_linger_timeout: Duration::from_secs(5),
            detail_log: false,
        }
    }
}

impl TcpConnectionParams {
    pub fn set_send_buffer_size(mut self, value: usize) -> Self {
        self.send_buffer_size = Some(value);
        self
    }
    pub fn set_recv_buffer_size(mut self, value: usize) -> Self {
        self.recv_buffer_size = Some(value);
        self
    }
    pub fn set_read_limit(mut self, value: usize) -> Self {
        self.read_limit = Some(value);
        self
    }
    pub fn set_write_limit(mut self, value: usize) -> Self {
        self.write_limit = Some(value);
        self
    }
    pub fn set_block_size(mut self, value: usize) -> Self {
        self.block_size = value;
        self
    }
    pub fn set_shutdown_linger_timeout(mut self, value: Duration) -> Self {
        self.shutdown_linger_timeout = value;
        self
    }
    pub fn set_detail_log(mut self, value: bool) -> Self {
        self.detail_log = value;
        self
    }
}

/// Configuration for a [`TcpAcceptor`](crate::TcpAcceptor).
#[derive(Clone)]
pub struct TcpAcceptorParams {
    /// Selectors that receive accepted connections, round-robin. Empty
    /// means the acceptor's own selector takes them.
    pub acceptor_threads: AcceptorThreads,
    /// Parameters applied to each accepted connection.
    pub tcp_connection_params: TcpConnectionParams,
    /// Listen backlog.
    pub max_backlog: usize,
    /// Emit per-acceptor debug logs.
    pub detail_log: bool,
}

impl Default for TcpAcceptorParams {
    fn default() -> Self {
        Self {
            acceptor_threads: AcceptorThreads::default(),
            tcp_connection_params: TcpConnectionParams::default(),
            max_backlog: 100,
            detail_log: false,
        }
    }
}

impl TcpAcceptorParams {
    pub fn set_acceptor_threads(mut self, value: AcceptorThreads) -> Self {
        self.acceptor_threads = value;
        self
    }
    pub fn set_tcp_connection_params(mut self, value: TcpConnectionParams) -> Self {
        self.tcp_connection_params = value;
        self
    }
    pub fn set_max_backlog(mut self, value: usize) -> Self {
        self.max_backlog = value;
        self
    }
    pub fn set_detail_log(mut self, value: bool) -> Self {
        self.detail_log = value;
        self
    }
}

/// Configuration for a [`DnsResolver`](crate::DnsResolver).
#[derive(Clone, Debug)]
pub struct DnsResolverOptions {
    /// Number of worker threads performing blocking resolution.
    pub num_threads: usize,
    /// Capacity of each worker's request queue.
    pub queue_size: usize,
    /// How long `resolve_async` waits for queue space before failing the
    /// request inline.
    pub put_timeout: Duration,
}

impl Default for DnsResolverOptions {
    fn default() -> Self {
        Self {
            num_threads: 4,
            queue_size: 100,
            put_timeout: Duration::from_millis(1),
        }
    }
}

impl DnsResolverOptions {
    pub fn set_num_threads(mut self, value: usize) -> Self {
        self.num_threads = value;
        self
    }
    pub fn set_queue_size(mut self, value: usize) -> Self {
        self.queue_size = value;
        self
    }
    pub fn set_put_timeout(mut self, value: Duration) -> Self {
        self.put_timeout = value;
        self
    }
}

/// Configuration for an [`MpmcQueue`](crate::MpmcQueue).
#[derive(Clone, Debug)]
pub struct MpmcQueueParams {
    /// Requested capacity; rounded up to the next power of two.
    pub capacity: usize,
    /// Maximum number of concurrently putting producers.
    pub producers: usize,
    /// Maximum number of concurrently getting consumers.
    pub consumers: usize,
    /// Back-off used when a peer must be waited for: zero spins with a
    /// pause, a positive duration parks on a semaphore for that long.
    pub wait_duration: Duration,
}

impl Default for MpmcQueueParams {
    fn default() -> Self {
        Self {
            capacity: 128,
            producers: 1,
            consumers: 1,
            wait_duration: Duration::from_micros(10),
        }
    }
}

impl MpmcQueueParams {
    pub fn set_capacity(mut self, value: usize) -> Self {
        self.capacity = value;
        self
    }
    pub fn set_producers(mut self, value: usize) -> Self {
        self.producers = value;
        self
    }
    pub fn set_consumers(mut self, value: usize) -> Self {
        self.consumers = value;
        self
    }
    pub fn set_wait_duration(mut self, value: Duration) -> Self {
        self.wait_duration = value;
        self
    }
}
