//! Interfaces of the collaborators a stream socket drives.
//!
//! The socket never performs I/O itself: a [`Proactor`] executes
//! asynchronous connects, sends, and receives and later invokes the
//! socket's `process_*` entry points with the completions; a
//! [`Resolver`] turns names into endpoints; [`Timer`]s realize retry
//! intervals and per-operation deadlines. All of these are held by the
//! socket as weak back-references ([`Observer`]): the collaborators own
//! the socket for the duration of attach→detach, never the reverse.

use bytes::Bytes;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::options::{GetEndpointOptions, LoadBalancingOptions};
use crate::socket::StreamSocket;
use crate::{Endpoint, Error, ShutdownType, Transport};

pub type Functor = Box<dyn FnOnce() + Send + 'static>;

/// A serial execution context. The proactor's strands serialize
/// callbacks for one socket across the engine's thread pool.
pub trait Executor: Send + Sync {
    fn execute(&self, f: Functor);
}

#[derive(Debug, Clone, Copy)]
pub struct TimerOptions {
    pub one_shot: bool,
    /// Deliver a `Cancelled` event when the timer is cancelled.
    pub show_cancelled: bool,
    /// Deliver a `Closed` event when the timer is closed.
    pub show_closed: bool,
}

impl Default for TimerOptions {
    fn default() -> Self {
        Self {
            one_shot: true,
            show_cancelled: false,
            show_closed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEventType {
    Deadline,
    Cancelled,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct TimerEvent {
    pub kind: TimerEventType,
    pub deadline: Option<Instant>,
}

pub type TimerCallback = Arc<dyn Fn(&TimerEvent) + Send + Sync>;

/// A timer scheduled on the proactor (or the process-wide fallback
/// service) and serviced on the socket's strand.
pub trait Timer: Send + Sync {
    /// Arm the timer. A `period` makes it recur after the first
    /// deadline.
    fn schedule(&self, deadline: Instant, period: Option<Duration>) -> Result<(), Error>;
    /// Disarm without releasing; the timer may be scheduled again.
    fn cancel(&self) -> Result<(), Error>;
    /// Disarm and release. The timer never fires again.
    fn close(&self);
}

/// The native, non-blocking system socket a stream socket operates.
/// Creation, adoption, and all state transitions flow through the owning
/// [`StreamSocket`]; the proactor performs the actual transfers.
pub trait SystemSocket: Send {
    fn handle(&self) -> u64;
    fn bind(&mut self, endpoint: &Endpoint, reuse_address: bool) -> Result<(), Error>;
    /// Bind to the wildcard for `transport`, assigning an ephemeral
    /// source endpoint.
    fn bind_any(&mut self, transport: Transport, reuse_address: bool) -> Result<(), Error>;
    fn source_endpoint(&self) -> Result<Endpoint, Error>;
    fn remote_endpoint(&self) -> Result<Endpoint, Error>;
    fn send_buffer_size(&self) -> Result<usize, Error>;
    fn receive_buffer_size(&self) -> Result<usize, Error>;
    fn shutdown(&mut self, direction: ShutdownType) -> Result<(), Error>;
    /// The last error recorded on the socket by the kernel, if any.
    fn last_error(&self) -> Option<Error>;
    fn close(&mut self);
}

/// A completion-based I/O engine.
///
/// `attach_socket` hands the engine a strong reference that it holds
/// until the asynchronous completion of `detach_socket`, which is
/// observed through [`StreamSocket::process_socket_detached`]. Exactly
/// one detach may be in flight per socket.
pub trait Proactor: Send + Sync {
    fn attach_socket(&self, socket: &Arc<StreamSocket>) -> Result<(), Error>;
    fn detach_socket(&self, socket: &Arc<StreamSocket>) -> Result<(), Error>;
    fn connect(&self, socket: &Arc<StreamSocket>, endpoint: &Endpoint) -> Result<(), Error>;
    /// Begin draining `data` into the kernel, at most `max_bytes` per
    /// transfer. Completion arrives at
    /// [`StreamSocket::process_socket_sent`].
    fn send(&self, socket: &Arc<StreamSocket>, data: Bytes, max_bytes: usize)
        -> Result<(), Error>;
    /// Begin one transfer of at most `max_bytes` out of the kernel.
    /// Completion arrives at
    /// [`StreamSocket::process_socket_received`].
    fn receive(&self, socket: &Arc<StreamSocket>, max_bytes: usize) -> Result<(), Error>;
    /// Cancel outstanding operations for `socket`; cancelled operations
    /// complete with `Error::Cancelled`.
    fn cancel(&self, socket: &Arc<StreamSocket>);
    /// Reserve capacity for one more handle. `false` means the engine
    /// is at its limit and `open` must fail with `Error::Limit`.
    fn acquire_handle_reservation(&self) -> bool;
    fn release_handle_reservation(&self);
    fn create_stream_socket(&self, transport: Transport) -> Result<Box<dyn SystemSocket>, Error>;
    fn create_strand(&self) -> Arc<dyn Executor>;
    fn create_timer(&self, options: TimerOptions, callback: TimerCallback) -> Arc<dyn Timer>;
    fn execute(&self, f: Functor);
    fn max_threads(&self) -> usize {
        1
    }
    fn thread_index(&self) -> usize {
        0
    }
}

/// Hands out proactors for load balancing and takes back their leases on
/// terminal close.
pub trait ProactorPool: Send + Sync {
    fn release_proactor(&self, proactor: &Arc<dyn Proactor>, options: &LoadBalancingOptions);
}

/// Where a name resolution was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverSource {
    Cache,
    System,
    Server,
    Unknown,
}

/// Diagnostics accompanying a resolution completion.
#[derive(Debug, Clone)]
pub struct GetEndpointEvent {
    pub error: Option<Error>,
    /// The authority (name) that was resolved.
    pub authority: Option<String>,
    pub latency: Option<Duration>,
    pub name_server: Option<Endpoint>,
    pub source: ResolverSource,
}

pub type GetEndpointCallback = Box<dyn FnOnce(Option<Endpoint>, GetEndpointEvent) + Send>;

pub trait Resolver: Send + Sync {
    fn get_endpoint(
        &self,
        name: &str,
        options: &GetEndpointOptions,
        callback: GetEndpointCallback,
    ) -> Result<(), Error>;
}

/// Bandwidth policy consulted before each transfer in a direction.
pub trait RateLimiter: Send + Sync {
    fn would_exceed_bandwidth(&self, now: Instant) -> bool;
    /// How long to wait before the next submission is admissible.
    fn calculate_time_to_submit(&self, now: Instant) -> Duration;
    /// Record `amount` bytes as consumed.
    fn submit(&self, amount: usize);
}

/// A weak back-reference: relation plus lookup, never ownership. The
/// socket observes its proactor, pool, and resolver through these so a
/// torn-down engine simply stops being found.
pub struct Observer<T: ?Sized> {
    target: Mutex<Option<Weak<T>>>,
}

impl<T: ?Sized> Observer<T> {
    pub fn new() -> Self {
        Self {
            target: Mutex::new(None),
        }
    }

    pub fn watch(&self, target: &Arc<T>) {
        let mut guard = match self.target.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(Arc::downgrade(target));
    }

    pub fn get(&self) -> Option<Arc<T>> {
        let guard = match self.target.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_ref().and_then(Weak::upgrade)
    }

    pub fn reset(&self) {
        let mut guard = match self.target.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
    }
}

impl<T: ?Sized> Default for Observer<T> {
    fn default() -> Self {
        Self::new()
    }
}
