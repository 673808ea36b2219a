//! Asynchronous DNS resolution over a pool of worker threads.
//!
//! Each worker drains its own bounded [`MpmcQueue`] of requests and calls
//! the system resolver; callers round-robin across the queues, so every
//! worker sees a serial request stream. Host names are converted to their
//! ASCII-compatible encoding (UTS-46, non-transitional) before hitting
//! `getaddrinfo`. Results are not cached.

use std::collections::HashSet;
use std::ffi::CString;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::Mutex;
use tracing::warn;

use crate::addr::IpAddress;
use crate::config::{DnsResolverOptions, MpmcQueueParams};
use crate::error::{Error, Result};
use crate::metrics;
use crate::queue::MpmcQueue;

/// Resolution outcome delivered to callers and async callbacks.
pub type DnsResult = Result<Arc<DnsHostInfo>>;

/// Callback invoked with the outcome of an async resolve. Runs on a
/// resolver worker thread; marshal back to a selector before touching
/// reactor-owned state.
pub type DnsCallback = Box<dyn FnOnce(DnsResult) + Send>;

/// The addresses known for one host name, with round-robin pickers.
pub struct DnsHostInfo {
    hostname: String,
    ipv4: Vec<IpAddress>,
    ipv6: Vec<IpAddress>,
    next_ip: AtomicUsize,
    next_ipv4: AtomicUsize,
    next_ipv6: AtomicUsize,
}

impl DnsHostInfo {
    pub fn new(hostname: impl Into<String>) -> Self {
        DnsHostInfo {
            hostname: hostname.into(),
            ipv4: Vec::new(),
            ipv6: Vec::new(),
            next_ip: AtomicUsize::new(0),
            next_ipv4: AtomicUsize::new(0),
            next_ipv6: AtomicUsize::new(0),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Resolved IPv4 addresses, in resolver order.
    pub fn ipv4(&self) -> &[IpAddress] {
        &self.ipv4
    }

    /// Resolved IPv6 addresses, in resolver order.
    pub fn ipv6(&self) -> &[IpAddress] {
        &self.ipv6
    }

    /// Whether any address is known.
    pub fn is_valid(&self) -> bool {
        !self.ipv4.is_empty() || !self.ipv6.is_empty()
    }

    pub fn set_addresses(&mut self, ipv4: Vec<IpAddress>, ipv6: Vec<IpAddress>) {
        self.ipv4 = ipv4;
        self.ipv6 = ipv6;
    }

    /// The first known address, IPv4 preferred.
    pub fn pick_first_address(&self) -> Option<IpAddress> {
        self.ipv4.first().or_else(|| self.ipv6.first()).copied()
    }

    pub fn pick_first_ipv4_address(&self) -> Option<IpAddress> {
        self.ipv4.first().copied()
    }

    pub fn pick_first_ipv6_address(&self) -> Option<IpAddress> {
        self.ipv6.first().copied()
    }

    /// Round-robin over all addresses, the IPv4 block first. Returns
    /// `None` iff no address is known.
    pub fn pick_next_address(&self) -> Option<IpAddress> {
        let total = self.ipv4.len() + self.ipv6.len();
        if total == 0 {
            return None;
        }
        let index = self.next_ip.fetch_add(1, Ordering::Relaxed) % total;
        if index < self.ipv4.len() {
            Some(self.ipv4[index])
        } else {
            Some(self.ipv6[index - self.ipv4.len()])
        }
    }

    /// Round-robin over the IPv4 addresses only.
    pub fn pick_next_ipv4_address(&self) -> Option<IpAddress> {
        if self.ipv4.is_empty() {
            return None;
        }
        let index = self.next_ipv4.fetch_add(1, Ordering::Relaxed) % self.ipv4.len();
        Some(self.ipv4[index])
    }

    /// Round-robin over the IPv6 addresses only.
    pub fn pick_next_ipv6_address(&self) -> Option<IpAddress> {
        if self.ipv6.is_empty() {
            return None;
        }
        let index = self.next_ipv6.fetch_add(1, Ordering::Relaxed) % self.ipv6.len();
        Some(self.ipv6[index])
    }

    /// The name actually handed to the system resolver: pure-ASCII names
    /// pass through byte-for-byte, anything else gets the UTS-46
    /// non-transitional ASCII-compatible encoding.
    pub fn dns_resolve_name(&self) -> Result<String> {
        if self.hostname.is_ascii() {
            return Ok(self.hostname.clone());
        }
        idna::domain_to_ascii(&self.hostname).map_err(|err| {
            Error::InvalidArgument(format!(
                "cannot encode host name `{}` for DNS: {err}",
                self.hostname
            ))
        })
    }
}

impl fmt::Display for DnsHostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hostname)?;
        for ip in &self.ipv4 {
            write!(f, " v4:{ip}")?;
        }
        for ip in &self.ipv6 {
            write!(f, " v6:{ip}")?;
        }
        Ok(())
    }
}

/// Queued resolve work. A request without a callback is the shutdown
/// sentinel for a worker.
struct DnsRequest {
    hostname: String,
    callback: Option<DnsCallback>,
}

/// Thread-pool name resolver. See [`DnsResolver::default_resolver`] for
/// the process-wide instance; tests construct private ones.
pub struct DnsResolver {
    options: DnsResolverOptions,
    queues: Vec<Arc<MpmcQueue<DnsRequest>>>,
    /// Serializes producers per queue: producer identity on the ring is a
    /// slot, not a thread, and async callers come from anywhere.
    put_guards: Vec<Mutex<()>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    next_queue: AtomicUsize,
}

impl DnsResolver {
    pub fn new(options: DnsResolverOptions) -> DnsResolver {
        assert!(options.num_threads > 0, "resolver needs worker threads");
        assert!(options.queue_size > 0, "resolver needs queue capacity");
        let mut queues = Vec::with_capacity(options.num_threads);
        let mut put_guards = Vec::with_capacity(options.num_threads);
        let mut threads = Vec::with_capacity(options.num_threads);
        for index in 0..options.num_threads {
            let queue = Arc::new(MpmcQueue::new(
                MpmcQueueParams::default()
                    .set_capacity(options.queue_size)
                    .set_producers(1)
                    .set_consumers(1),
            ));
            queues.push(queue.clone());
            put_guards.push(Mutex::new(()));
            let handle = thread::Builder::new()
                .name(format!("wireline-dns-{index}"))
                .spawn(move || run_resolve(queue))
                .expect("spawning DNS resolver thread");
            threads.push(handle);
        }
        DnsResolver {
            options,
            queues,
            put_guards,
            threads: Mutex::new(threads),
            next_queue: AtomicUsize::new(0),
        }
    }

    /// The process-wide resolver, built on first use with default options.
    pub fn default_resolver() -> &'static DnsResolver {
        static DEFAULT: OnceLock<DnsResolver> = OnceLock::new();
        DEFAULT.get_or_init(|| DnsResolver::new(DnsResolverOptions::default()))
    }

    /// Resolve synchronously on the calling thread.
    pub fn resolve(&self, hostname: &str) -> DnsResult {
        resolve_blocking(hostname)
    }

    /// Resolve on a worker thread; `callback` gets the outcome. When the
    /// chosen queue stays full past `put_timeout`, the callback is invoked
    /// inline with [`Error::Unavailable`].
    pub fn resolve_async(&self, hostname: &str, callback: impl FnOnce(DnsResult) + Send + 'static) {
        let index = self.next_queue.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        let request = DnsRequest {
            hostname: hostname.to_string(),
            callback: Some(Box::new(callback)),
        };
        let rejected = {
            let _guard = self.put_guards[index].lock();
            self.queues[index].put_timeout(request, 0, self.options.put_timeout)
        };
        if let Err(request) = rejected {
            if let Some(callback) = request.callback {
                callback(Err(Error::Unavailable(
                    "asynchronous resolve queue is full".into(),
                )));
            }
        }
    }
}

impl Drop for DnsResolver {
    fn drop(&mut self) {
        // One sentinel per queue lets each worker exit after finishing its
        // in-flight request.
        for (queue, guard) in self.queues.iter().zip(&self.put_guards) {
            let _guard = guard.lock();
            queue.put(
                DnsRequest {
                    hostname: String::new(),
                    callback: None,
                },
                0,
            );
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("DNS resolver thread panicked");
            }
        }
    }
}

fn run_resolve(queue: Arc<MpmcQueue<DnsRequest>>) {
    loop {
        let request = queue.get(0);
        match request.callback {
            None => break,
            Some(callback) => callback(resolve_blocking(&request.hostname)),
        }
    }
}

// glibc extension results not exported by the libc crate on every target.
const EAI_ADDRFAMILY: libc::c_int = -9;
const EAI_NODATA: libc::c_int = -5;

fn gai_error(err: libc::c_int, hostname: &str) -> Error {
    match err {
        EAI_ADDRFAMILY => Error::InvalidArgument(format!(
            "`{hostname}` has no addresses in the requested address family"
        )),
        libc::EAI_AGAIN => Error::Unavailable(format!(
            "temporary failure resolving `{hostname}`, try again later"
        )),
        libc::EAI_BADFLAGS => {
            Error::InvalidArgument(format!("invalid resolver flags for `{hostname}`"))
        }
        libc::EAI_FAIL => Error::Internal(format!(
            "name server permanent failure resolving `{hostname}`"
        )),
        libc::EAI_FAMILY => Error::Unimplemented(format!(
            "requested address family unsupported for `{hostname}`"
        )),
        libc::EAI_MEMORY => {
            Error::Unavailable(format!("out of memory resolving `{hostname}`"))
        }
        EAI_NODATA => Error::NotFound(format!(
            "`{hostname}` exists but has no network addresses defined"
        )),
        libc::EAI_NONAME => Error::NotFound(format!("node or service `{hostname}` unknown")),
        libc::EAI_SERVICE => Error::NotFound(format!(
            "service not available for the socket type of `{hostname}`"
        )),
        libc::EAI_SOCKTYPE => {
            Error::NotFound(format!("socket type unsupported resolving `{hostname}`"))
        }
        libc::EAI_SYSTEM => Error::last_os(format!("::getaddrinfo failed for `{hostname}`")),
        other => Error::Internal(format!(
            "unknown ::getaddrinfo failure {other} for `{hostname}`"
        )),
    }
}

/// One `getaddrinfo` round trip: IDN-encode, resolve, dedupe preserving
/// the system's ordering within each family.
fn resolve_blocking(hostname: &str) -> DnsResult {
    metrics::DNS_LOOKUPS.increment();
    let result = resolve_inner(hostname);
    if result.is_err() {
        metrics::DNS_FAILURES.increment();
    }
    result
}

fn resolve_inner(hostname: &str) -> DnsResult {
    let mut info = DnsHostInfo::new(hostname);
    let resolve_name = info.dns_resolve_name()?;
    let c_name = CString::new(resolve_name).map_err(|_| {
        Error::InvalidArgument(format!("host name `{hostname}` contains a NUL byte"))
    })?;

    let mut result: *mut libc::addrinfo = std::ptr::null_mut();
    let err = unsafe {
        libc::getaddrinfo(c_name.as_ptr(), std::ptr::null(), std::ptr::null(), &mut result)
    };
    if err != 0 {
        return Err(gai_error(err, hostname));
    }

    let mut seen: HashSet<IpAddress> = HashSet::new();
    let mut ipv4 = Vec::new();
    let mut ipv6 = Vec::new();
    let mut cursor = result;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        if !entry.ai_addr.is_null() {
            let storage = unsafe { &*(entry.ai_addr as *const libc::sockaddr_storage) };
            if let Ok(ip) = IpAddress::parse_from_sockaddr(storage) {
                if seen.insert(ip) {
                    if ip.is_ipv4() {
                        ipv4.push(ip);
                    } else {
                        ipv6.push(ip);
                    }
                }
            }
        }
        cursor = entry.ai_next;
    }
    unsafe { libc::freeaddrinfo(result) };

    info.set_addresses(ipv4, ipv6);
    Ok(Arc::new(info))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_info(v4: &[&str], v6: &[&str]) -> DnsHostInfo {
        let mut info = DnsHostInfo::new("test-host");
        info.set_addresses(
            v4.iter()
                .map(|s| IpAddress::parse_from_string(s).unwrap())
                .collect(),
            v6.iter()
                .map(|s| IpAddress::parse_from_string(s).unwrap())
                .collect(),
        );
        info
    }

    #[test]
    fn pick_first_prefers_ipv4() {
        let info = host_info(&["1.1.1.1", "2.2.2.2"], &["::1"]);
        assert_eq!(info.pick_first_address().unwrap().to_string(), "1.1.1.1");
        assert_eq!(
            info.pick_first_ipv6_address().unwrap().to_string(),
            "::1"
        );
        let v6_only = host_info(&[], &["::2"]);
        assert_eq!(v6_only.pick_first_address().unwrap().to_string(), "::2");
        assert!(v6_only.pick_first_ipv4_address().is_none());
    }

    #[test]
    fn pick_next_round_robins_v4_then_v6() {
        let info = host_info(&["1.1.1.1", "2.2.2.2"], &["::1"]);
        let picks: Vec<String> = (0..4)
            .map(|_| info.pick_next_address().unwrap().to_string())
            .collect();
        assert_eq!(picks, ["1.1.1.1", "2.2.2.2", "::1", "1.1.1.1"]);
    }

    #[test]
    fn pick_next_none_iff_no_addresses() {
        let empty = host_info(&[], &[]);
        assert!(empty.pick_next_address().is_none());
        assert!(!empty.is_valid());
        let one = host_info(&["9.9.9.9"], &[]);
        assert!(one.pick_next_address().is_some());
        assert!(one.is_valid());
    }

    #[test]
    fn per_family_round_robin_is_independent() {
        let info = host_info(&["1.1.1.1", "2.2.2.2"], &["::1", "::2"]);
        assert_eq!(info.pick_next_ipv4_address().unwrap().to_string(), "1.1.1.1");
        assert_eq!(info.pick_next_ipv6_address().unwrap().to_string(), "::1");
        assert_eq!(info.pick_next_ipv4_address().unwrap().to_string(), "2.2.2.2");
        assert_eq!(info.pick_next_ipv6_address().unwrap().to_string(), "::2");
    }

    #[test]
    fn ascii_names_pass_through() {
        let info = DnsHostInfo::new("Example.COM");
        assert_eq!(info.dns_resolve_name().unwrap(), "Example.COM");
    }

    #[test]
    fn idn_names_are_punycoded() {
        let info = DnsHostInfo::new("bücher.example");
        assert_eq!(info.dns_resolve_name().unwrap(), "xn--bcher-kva.example");
        let info = DnsHostInfo::new("日本語.example");
        assert_eq!(
            info.dns_resolve_name().unwrap(),
            "xn--wgv71a119e.example"
        );
    }

    #[test]
    fn resolve_localhost() {
        let resolver = DnsResolver::new(DnsResolverOptions::default().set_num_threads(1));
        let info = resolver.resolve("localhost").expect("localhost resolves");
        assert!(info.is_valid());
        let ip = info.pick_first_address().unwrap();
        assert!(ip == IpAddress::IPV4_LOOPBACK || ip == IpAddress::IPV6_LOOPBACK);
    }

    #[test]
    fn resolve_async_delivers_on_worker() {
        let resolver = DnsResolver::new(DnsResolverOptions::default().set_num_threads(2));
        let (tx, rx) = std::sync::mpsc::channel();
        resolver.resolve_async("localhost", move |result| {
            tx.send(result.map(|info| info.is_valid())).unwrap();
        });
        let outcome = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("callback delivered");
        assert_eq!(outcome.unwrap(), true);
    }

    #[test]
    fn resolve_unknown_host_fails() {
        let resolver = DnsResolver::new(DnsResolverOptions::default().set_num_threads(1));
        let result = resolver.resolve("this-host-does-not-exist.invalid");
        assert!(result.is_err());
    }
}
