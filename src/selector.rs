//! The selector: a single-threaded event reactor over a loop backend, with
//! a cross-thread deferred-task queue, alarms, and wake-up plumbing.
//!
//! One OS thread runs [`Selector::run`]; every registered
//! [`Selectable`] has its handlers invoked on that thread only. Other
//! threads interact through [`Selector::run_in_select_loop`],
//! [`Selector::register_alarm`] / [`Selector::unregister_alarm`] and
//! [`Selector::make_loop_exit`] — registration and desire changes must be
//! posted into the loop:
//!
//! ```ignore
//! selector.run_in_select_loop(move || {
//!     if let Err(err) = target.register(&selectable) {
//!         warn!("registration failed: {err}");
//!     }
//! });
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::SelectorParams;
use crate::counter::thread_id;
use crate::error::{Error, Result, Status};
use crate::event::{desire, SelectorEvent, INVALID_FD};
use crate::metrics;
use crate::poller::{LoopBackend, PollLoop};
use crate::selectable::Selectable;

#[cfg(target_os = "linux")]
use crate::poller::EpollLoop;

/// A parameterless closure posted to a selector to run on its thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Identifies a registered alarm; never reused within a selector's
/// lifetime.
pub type AlarmId = u64;

/// Nanoseconds on a process-wide monotonic clock.
pub(crate) fn monotonic_ns() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_nanos().min(i64::MAX as u128) as i64
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::last_os(format!("::fcntl F_GETFL failed for fd {fd}")));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::last_os(format!("::fcntl F_SETFL failed for fd {fd}")));
    }
    Ok(())
}

struct AlarmState {
    /// Live alarm callbacks by id. An id present in the heap but absent
    /// here was cancelled; the heap entry is a tombstone.
    callbacks: HashMap<AlarmId, Task>,
    /// Deadlines ordered (deadline, id) — ids are monotonic, so alarms with
    /// equal deadlines fire in registration order.
    heap: BinaryHeap<Reverse<(i64, AlarmId)>>,
}

/// The event reactor. Create with [`Selector::new`], run with
/// [`Selector::run`] (usually via [`SelectorThread`]).
pub struct Selector {
    params: SelectorParams,

    /// Thread id of the loop while running, 0 otherwise.
    tid: AtomicU64,
    should_end: AtomicBool,

    /// Read side of the wake-up mechanism, registered with the backend.
    wake_read_fd: RawFd,
    /// Write side; equals `wake_read_fd` for an eventfd.
    wake_write_fd: RawFd,

    backend: Mutex<LoopBackend>,

    /// Registered selectables by fd. Weak: the selector keeps bookkeeping,
    /// not ownership. Touched only from the loop thread (or before start).
    registered: Mutex<HashMap<RawFd, Weak<dyn Selectable>>>,

    to_run: Mutex<VecDeque<Task>>,
    have_to_run: AtomicBool,

    alarms: Mutex<AlarmState>,
    /// The heap minimum as nanos, `i64::MAX` when empty; lets the loop
    /// peek the next deadline without the lock.
    next_alarm_time: AtomicI64,
    num_alarms: AtomicUsize,
    alarm_id: AtomicU64,

    /// Last time the loop came back from the backend, nanos.
    now_ns: AtomicI64,

    call_on_close: Mutex<Option<Task>>,
}

impl Selector {
    /// Create a selector with its wake-up fd and loop backend.
    pub fn new(params: SelectorParams) -> Result<Arc<Selector>> {
        let (wake_read_fd, wake_write_fd) = Self::create_wake_fds(&params)?;
        let backend = Self::create_backend(&params, wake_read_fd).inspect_err(|_| unsafe {
            libc::close(wake_read_fd);
            if wake_write_fd != wake_read_fd {
                libc::close(wake_write_fd);
            }
        })?;
        Ok(Arc::new(Selector {
            params,
            tid: AtomicU64::new(0),
            should_end: AtomicBool::new(false),
            wake_read_fd,
            wake_write_fd,
            backend: Mutex::new(backend),
            registered: Mutex::new(HashMap::new()),
            to_run: Mutex::new(VecDeque::new()),
            have_to_run: AtomicBool::new(false),
            alarms: Mutex::new(AlarmState {
                callbacks: HashMap::new(),
                heap: BinaryHeap::new(),
            }),
            next_alarm_time: AtomicI64::new(i64::MAX),
            num_alarms: AtomicUsize::new(0),
            alarm_id: AtomicU64::new(0),
            now_ns: AtomicI64::new(monotonic_ns()),
            call_on_close: Mutex::new(None),
        }))
    }

    #[cfg(target_os = "linux")]
    fn create_wake_fds(params: &SelectorParams) -> Result<(RawFd, RawFd)> {
        if params.use_event_fd {
            let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if efd < 0 {
                return Err(Error::last_os("::eventfd failed"));
            }
            return Ok((efd, efd));
        }
        Self::create_wake_pipe()
    }

    #[cfg(not(target_os = "linux"))]
    fn create_wake_fds(_params: &SelectorParams) -> Result<(RawFd, RawFd)> {
        Self::create_wake_pipe()
    }

    fn create_wake_pipe() -> Result<(RawFd, RawFd)> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::last_os("::pipe failed for wake-up fds"));
        }
        for fd in fds {
            if let Err(err) = set_nonblocking(fd) {
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
        Ok((fds[0], fds[1]))
    }

    fn create_backend(params: &SelectorParams, wake_read_fd: RawFd) -> Result<LoopBackend> {
        if params.use_epoll {
            #[cfg(target_os = "linux")]
            {
                return Ok(LoopBackend::Epoll(EpollLoop::new(
                    wake_read_fd,
                    params.max_events_per_step,
                )?));
            }
            #[cfg(not(target_os = "linux"))]
            {
                return Err(Error::Unimplemented(
                    "epoll is not available on this system".into(),
                ));
            }
        }
        Ok(LoopBackend::Poll(PollLoop::new(
            wake_read_fd,
            params.max_events_per_step,
        )?))
    }

    pub fn params(&self) -> &SelectorParams {
        &self.params
    }

    /// The last time the loop returned from the backend, as monotonic
    /// nanoseconds.
    pub fn now_nanos(&self) -> i64 {
        self.now_ns.load(Ordering::Acquire)
    }

    fn update_now(&self) {
        self.now_ns.store(monotonic_ns(), Ordering::Release);
    }

    /// Whether the caller runs on this selector's loop thread.
    pub fn is_in_select_thread(&self) -> bool {
        self.tid.load(Ordering::Acquire) == thread_id()
    }

    /// Whether some thread is currently inside [`run`](Self::run).
    pub fn is_running(&self) -> bool {
        self.tid.load(Ordering::Acquire) != 0
    }

    /// Whether the loop was asked to exit. Callbacks may still execute.
    pub fn is_exiting(&self) -> bool {
        self.should_end.load(Ordering::Acquire)
    }

    /// Set a function invoked after the loop drained and closed everything.
    pub fn set_call_on_close(&self, call_on_close: impl FnOnce() + Send + 'static) {
        *self.call_on_close.lock() = Some(Box::new(call_on_close));
    }

    /// Schedule the loop to exit. Safe from any thread.
    pub fn make_loop_exit(self: &Arc<Self>) {
        if self.is_in_select_thread() || !self.is_running() {
            self.should_end.store(true, Ordering::Release);
        } else {
            // Posting (rather than storing) orders the exit after tasks
            // already queued from this thread.
            let selector = self.clone();
            self.run_in_select_loop(move || {
                selector.should_end.store(true, Ordering::Release);
            });
        }
    }

    /// Reject loop-thread-only calls made from elsewhere once the loop
    /// runs. Anything goes while the selector is stopped.
    fn check_in_loop(&self, what: &str) -> Result<()> {
        let tid = self.tid.load(Ordering::Acquire);
        if tid == 0 || tid == thread_id() {
            Ok(())
        } else {
            Err(Error::FailedPrecondition(format!(
                "{what} requires the selector thread (or a stopped selector)"
            )))
        }
    }

    fn owned_by_us(&self, s: &dyn Selectable) -> Result<()> {
        match s.base().selector() {
            Some(owner) if std::ptr::eq(Arc::as_ptr(&owner), self as *const Selector) => Ok(()),
            _ => Err(Error::FailedPrecondition(
                "selectable is registered with a different selector".into(),
            )),
        }
    }

    /// Register an I/O object for event callbacks. Idempotent. Loop-thread
    /// only once the loop runs.
    pub fn register(self: &Arc<Self>, s: &Arc<dyn Selectable>) -> Result<()> {
        self.check_in_loop("Selector::register")?;
        let took_ownership = match s.base().selector() {
            None => {
                s.base().set_selector(Some(self.clone()));
                true
            }
            Some(owner) => {
                if !std::ptr::eq(Arc::as_ptr(&owner), Arc::as_ptr(self)) {
                    return Err(Error::FailedPrecondition(
                        "selectable is registered with a different selector".into(),
                    ));
                }
                false
            }
        };
        let fd = s.base().fd();
        debug_assert!(fd >= 0, "registering a selectable without an fd");
        let mut registered = self.registered.lock();
        if registered.contains_key(&fd) {
            return Ok(());
        }
        registered.insert(fd, Arc::downgrade(s));
        drop(registered);
        if let Err(err) = self.backend.lock().add(fd, s.base().desire()) {
            self.registered.lock().remove(&fd);
            if took_ownership {
                s.base().set_selector(None);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Unregister a previously registered I/O object. Loop-thread only
    /// once the loop runs.
    pub fn unregister(&self, s: &dyn Selectable) -> Result<()> {
        self.check_in_loop("Selector::unregister")?;
        self.owned_by_us(s)?;
        let fd = s.base().fd();
        self.registered.lock().remove(&fd);
        s.base().set_selector(None);
        self.backend.lock().remove(fd)
    }

    pub fn enable_read_callback(&self, s: &dyn Selectable, enable: bool) -> Result<()> {
        self.update_desire(s, enable, desire::READ)
    }

    pub fn enable_write_callback(&self, s: &dyn Selectable, enable: bool) -> Result<()> {
        self.update_desire(s, enable, desire::WRITE)
    }

    fn update_desire(&self, s: &dyn Selectable, enable: bool, bit: u32) -> Result<()> {
        self.check_in_loop("Selector::update_desire")?;
        self.owned_by_us(s)?;
        let current = s.base().desire();
        if (enable && current & bit == bit) || (!enable && current & bit == 0) {
            return Ok(());
        }
        let updated = if enable { current | bit } else { current & !bit };
        s.base().set_desire(updated);
        self.backend.lock().update(s.base().fd(), updated)
    }

    /// Close every registered selectable, until none remain. Loop-thread
    /// only once the loop runs.
    pub fn clean_and_close_all(&self) -> Result<()> {
        self.check_in_loop("Selector::clean_and_close_all")?;
        loop {
            let entry = {
                let registered = self.registered.lock();
                registered.iter().next().map(|(fd, weak)| (*fd, weak.clone()))
            };
            let Some((fd, weak)) = entry else {
                return Ok(());
            };
            if let Some(s) = weak.upgrade() {
                // A proper close re-enters unregister and drops the entry.
                s.close();
            }
            let mut registered = self.registered.lock();
            if registered.remove(&fd).is_some() {
                drop(registered);
                // The selectable did not unregister itself (or was already
                // dead); drop the backend entry directly.
                if let Err(err) = self.backend.lock().remove(fd) {
                    debug!("dropping stale fd {fd} from backend: {err}");
                }
            }
        }
    }

    /// Run `callback` on the loop thread, in posting order. Safe from any
    /// thread.
    pub fn run_in_select_loop(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut to_run = self.to_run.lock();
            to_run.push_back(Box::new(callback));
            self.have_to_run.store(true, Ordering::Release);
        }
        if !self.is_in_select_thread() {
            self.send_wake_signal();
        }
    }

    /// Run `callback` on the loop thread after `timeout`. Safe from any
    /// thread. The returned id can cancel the alarm.
    pub fn register_alarm(
        &self,
        callback: impl FnOnce() + Send + 'static,
        timeout: Duration,
    ) -> AlarmId {
        let deadline =
            monotonic_ns().saturating_add(timeout.as_nanos().min(i64::MAX as u128) as i64);
        let mut alarms = self.alarms.lock();
        let alarm_id = self.alarm_id.fetch_add(1, Ordering::AcqRel);
        alarms.callbacks.insert(alarm_id, Box::new(callback));
        alarms.heap.push(Reverse((deadline, alarm_id)));
        let next = alarms
            .heap
            .peek()
            .map(|Reverse((deadline, _))| *deadline)
            .unwrap_or(i64::MAX);
        self.num_alarms.store(alarms.callbacks.len(), Ordering::Release);
        let previous = self.next_alarm_time.swap(next, Ordering::AcqRel);
        drop(alarms);
        // A sleeping loop planned its wait around the previous deadline.
        if next < previous && !self.is_in_select_thread() {
            self.send_wake_signal();
        }
        alarm_id
    }

    /// Cancel an alarm. The heap entry becomes a tombstone, filtered at
    /// fire time. Safe from any thread.
    pub fn unregister_alarm(&self, alarm_id: AlarmId) {
        let mut alarms = self.alarms.lock();
        alarms.callbacks.remove(&alarm_id);
        self.num_alarms.store(alarms.callbacks.len(), Ordering::Release);
    }

    /// Number of alarms currently registered (cancelled ones excluded).
    pub fn num_registered_alarms(&self) -> usize {
        self.num_alarms.load(Ordering::Acquire)
    }

    // ── Event predicates ────────────────────────────────────────────

    pub fn is_hang_up_event(&self, raw: u32) -> bool {
        self.backend.lock().is_hang_up_event(raw)
    }
    pub fn is_remote_hang_up_event(&self, raw: u32) -> bool {
        self.backend.lock().is_remote_hang_up_event(raw)
    }
    pub fn is_any_hang_up_event(&self, raw: u32) -> bool {
        self.backend.lock().is_any_hang_up_event(raw)
    }
    pub fn is_error_event(&self, raw: u32) -> bool {
        self.backend.lock().is_error_event(raw)
    }
    pub fn is_input_event(&self, raw: u32) -> bool {
        self.backend.lock().is_input_event(raw)
    }

    // ── The loop ────────────────────────────────────────────────────

    /// Run the select loop until [`make_loop_exit`](Self::make_loop_exit).
    /// Blocks the calling thread. On a clean exit every remaining
    /// selectable is closed and the call-on-close hook runs; a backend
    /// failure aborts the loop and is returned.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        self.should_end.store(false, Ordering::Release);
        self.tid.store(thread_id(), Ordering::Release);

        let result = self.run_steps();
        if result.is_ok() {
            if let Err(err) = self.clean_and_close_all() {
                warn!("error while closing remaining selectables: {err}");
            }
            if let Some(call_on_close) = self.call_on_close.lock().take() {
                call_on_close();
            }
        }
        self.tid.store(0, Ordering::Release);
        result
    }

    fn run_steps(self: &Arc<Self>) -> Result<()> {
        while !self.should_end.load(Ordering::Acquire) {
            self.update_now();
            let timeout = self.step_timeout();
            let events = self.backend.lock().wait(timeout)?;
            self.update_now();
            for event in events {
                self.dispatch_event(event);
            }
            self.loop_callbacks();
            self.loop_alarms();
        }
        Ok(())
    }

    fn step_timeout(&self) -> Duration {
        if self.have_to_run.load(Ordering::Acquire) {
            return Duration::ZERO;
        }
        let mut timeout = self.params.default_loop_timeout;
        let next_alarm = self.next_alarm_time.load(Ordering::Acquire);
        if next_alarm != i64::MAX {
            let now = self.now_nanos();
            if next_alarm <= now {
                return Duration::ZERO;
            }
            timeout = timeout.min(Duration::from_nanos((next_alarm - now) as u64));
        }
        timeout
    }

    fn dispatch_event(self: &Arc<Self>, event: SelectorEvent) {
        let selectable = {
            let registered = self.registered.lock();
            registered.get(&event.fd).cloned()
        };
        // Absent: the wake-up fd, or unregistered earlier in this batch.
        let Some(s) = selectable.and_then(|weak| weak.upgrade()) else {
            return;
        };
        if self.owned_by_us(&*s).is_err() {
            return;
        }
        // A handler may close the object, invalidating its fd; stop
        // dispatching the remaining sub-events when that happens.
        let mut keep_processing = true;
        if event.desires & desire::ERROR != 0 {
            keep_processing = s.handle_error_event(event) && s.base().fd() != INVALID_FD;
        }
        if keep_processing && event.desires & desire::READ != 0 {
            keep_processing = s.handle_read_event(event) && s.base().fd() != INVALID_FD;
        }
        if keep_processing && event.desires & desire::WRITE != 0 {
            s.handle_write_event(event);
        }
    }

    fn loop_callbacks(&self) -> usize {
        let max = self.params.max_callbacks_per_event;
        let mut run_count = 0;
        while self.have_to_run.load(Ordering::Acquire) && run_count < max {
            self.update_now();
            let n = self.run_callbacks(max - run_count);
            if n == 0 {
                break;
            }
            run_count += n;
        }
        run_count
    }

    fn run_callbacks(&self, max_to_run: usize) -> usize {
        self.drain_wake_fd();
        let mut batch: VecDeque<Task> = VecDeque::new();
        {
            let mut to_run = self.to_run.lock();
            while batch.len() < max_to_run {
                match to_run.pop_front() {
                    Some(task) => batch.push_back(task),
                    None => break,
                }
            }
            self.have_to_run.store(!to_run.is_empty(), Ordering::Release);
        }
        let deadline = Instant::now() + self.params.callbacks_timeout_per_event;
        let mut num_run = 0usize;
        while let Some(task) = batch.pop_front() {
            task();
            num_run += 1;
            if Instant::now() >= deadline {
                break;
            }
        }
        if !batch.is_empty() {
            // Over budget: requeue the leftovers ahead of anything newly
            // posted, preserving order.
            let mut to_run = self.to_run.lock();
            while let Some(task) = batch.pop_back() {
                to_run.push_front(task);
            }
            self.have_to_run.store(true, Ordering::Release);
        }
        metrics::TASKS_RUN.add(num_run as u64);
        num_run
    }

    fn loop_alarms(&self) -> usize {
        self.update_now();
        let now = self.now_nanos();
        if self.next_alarm_time.load(Ordering::Acquire) > now {
            return 0;
        }
        let mut due: Vec<Task> = Vec::new();
        {
            let mut alarms = self.alarms.lock();
            while let Some(Reverse((deadline, alarm_id))) = alarms.heap.peek().copied() {
                if deadline > now {
                    break;
                }
                alarms.heap.pop();
                if let Some(task) = alarms.callbacks.remove(&alarm_id) {
                    due.push(task);
                }
            }
            self.num_alarms.store(alarms.callbacks.len(), Ordering::Release);
            let next = alarms
                .heap
                .peek()
                .map(|Reverse((deadline, _))| *deadline)
                .unwrap_or(i64::MAX);
            self.next_alarm_time.store(next, Ordering::Release);
        }
        let fired = due.len();
        for task in due {
            task();
        }
        metrics::ALARMS_FIRED.add(fired as u64);
        fired
    }

    fn send_wake_signal(&self) {
        let value: u64 = 1;
        let cb = unsafe {
            libc::write(
                self.wake_write_fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if cb < 0 {
            let err = std::io::Error::last_os_error();
            // EAGAIN just means the wake fd already has a pending signal.
            if err.raw_os_error() != Some(libc::EAGAIN) {
                warn!("error writing wake-up value to selector fd: {err}");
            }
        }
    }

    fn drain_wake_fd(&self) {
        let mut buffer = [0u8; 512];
        loop {
            let cb = unsafe {
                libc::read(
                    self.wake_read_fd,
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                )
            };
            if cb <= 0 {
                break;
            }
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        debug_assert!(
            self.registered.lock().is_empty(),
            "selector dropped with registered selectables"
        );
        unsafe {
            libc::close(self.wake_read_fd);
            if self.wake_write_fd != self.wake_read_fd {
                libc::close(self.wake_write_fd);
            }
        }
    }
}

/// A selector wrapped in an OS thread.
pub struct SelectorThread {
    selector: Arc<Selector>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    loop_status: Arc<Mutex<Status>>,
    is_started: AtomicBool,
}

impl SelectorThread {
    /// Create a *stopped* selector thread.
    pub fn new(params: SelectorParams) -> Result<SelectorThread> {
        Ok(SelectorThread {
            selector: Selector::new(params)?,
            thread: Mutex::new(None),
            loop_status: Arc::new(Mutex::new(Ok(()))),
            is_started: AtomicBool::new(false),
        })
    }

    /// Start the loop in its thread. Returns false when already started.
    pub fn start(&self) -> bool {
        let mut thread = self.thread.lock();
        if thread.is_some() || self.is_started.load(Ordering::Acquire) {
            return false;
        }
        let selector = self.selector.clone();
        let loop_status = self.loop_status.clone();
        let handle = thread::Builder::new()
            .name("wireline-selector".to_string())
            .spawn(move || {
                let result = selector.run();
                *loop_status.lock() = result;
            });
        match handle {
            Ok(handle) => {
                *thread = Some(handle);
                self.is_started.store(true, Ordering::Release);
                true
            }
            Err(err) => {
                warn!("failed to spawn selector thread: {err}");
                false
            }
        }
    }

    /// Exit the loop and join the thread. Returns false when already
    /// stopped. Idempotent.
    pub fn stop(&self) -> bool {
        let handle = self.thread.lock().take();
        let Some(handle) = handle else {
            return false;
        };
        self.selector.make_loop_exit();
        if handle.join().is_err() {
            warn!("selector thread panicked");
        }
        self.is_started.store(false, Ordering::Release);
        true
    }

    /// Post a close-everything request into the loop.
    pub fn clean_and_close_all(&self) {
        let selector = self.selector.clone();
        self.selector.run_in_select_loop(move || {
            if let Err(err) = selector.clean_and_close_all() {
                warn!("clean_and_close_all failed: {err}");
            }
        });
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn is_started(&self) -> bool {
        self.is_started.load(Ordering::Acquire)
    }

    /// The terminal status of the most recent loop run.
    pub fn loop_status(&self) -> Status {
        self.loop_status.lock().clone()
    }
}

impl Drop for SelectorThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns();
        std::thread::sleep(Duration::from_millis(2));
        let b = monotonic_ns();
        assert!(b > a);
    }

    #[test]
    fn alarm_ids_are_unique() {
        let selector = Selector::new(SelectorParams::default()).unwrap();
        let a = selector.register_alarm(|| {}, Duration::from_secs(100));
        let b = selector.register_alarm(|| {}, Duration::from_secs(100));
        selector.unregister_alarm(a);
        let c = selector.register_alarm(|| {}, Duration::from_secs(100));
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        selector.unregister_alarm(b);
        selector.unregister_alarm(c);
    }

    #[test]
    fn next_alarm_time_tracks_minimum() {
        let selector = Selector::new(SelectorParams::default()).unwrap();
        assert_eq!(selector.next_alarm_time.load(Ordering::Acquire), i64::MAX);
        let far = selector.register_alarm(|| {}, Duration::from_secs(100));
        let t_far = selector.next_alarm_time.load(Ordering::Acquire);
        let near = selector.register_alarm(|| {}, Duration::from_secs(1));
        let t_near = selector.next_alarm_time.load(Ordering::Acquire);
        assert!(t_near < t_far);
        selector.unregister_alarm(far);
        selector.unregister_alarm(near);
    }

    #[test]
    fn poll_variant_constructs() {
        let params = SelectorParams::default()
            .set_use_epoll(false)
            .set_use_event_fd(false);
        let selector = Selector::new(params).unwrap();
        assert!(!selector.is_in_select_thread());
        assert!(!selector.is_exiting());
    }
}
