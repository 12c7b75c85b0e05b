//! The stream socket state machine.
//!
//! A [`StreamSocket`] composes the open, flow-control, shutdown, and
//! detach state machines with a send queue, a receive queue, and an
//! optional TLS session into an ordered, reliable, optionally-encrypted
//! byte stream. It performs no I/O: the proactor executes the actual
//! transfers and feeds completions back through the `process_socket_*`
//! entry points, each of which acquires the single per-socket mutex
//! before touching state.
//!
//! User callbacks never run under that mutex. Work performed inside the
//! critical section accumulates announcements which are fired after the
//! guard is dropped: deferred announcements trampoline through the
//! socket's strand, non-deferred announcements run inline in the calling
//! frame.

use bytes::{Bytes, BytesMut};
use slog::{debug, trace, warn, Logger};
use std::collections::VecDeque;
use std::mem;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::event::{
    CloseCallback, ConnectCallback, ConnectContext, ConnectEvent, DowngradeEvent, ErrorContext,
    ErrorEvent, ReadQueueEvent, ReceiveCallback, ReceiveContext, ReceiveEvent, SendCallback,
    SendContext, SendEvent, ShutdownEvent, SocketListener, SocketManager, UpgradeCallback,
    UpgradeContext, UpgradeEvent, WriteQueueEvent,
};
use crate::event::{BindCallback, BindContext, BindEvent};
use crate::options::{
    BindOptions, ConnectOptions, GetEndpointOptions, ReceiveOptions, SendOptions,
    StreamSocketOptions, UpgradeOptions,
};
use crate::proactor::{
    Executor, Functor, Observer, Proactor, ProactorPool, RateLimiter, Resolver, SystemSocket,
    Timer, TimerCallback, TimerEvent, TimerEventType, TimerOptions,
};
use crate::queue::{ReceiveCallbackEntry, ReceiveQueue, SendQueue, SendQueueEntry};
use crate::session::Encryption;
use crate::state::{
    DetachState, FlowControlContext, FlowControlState, OpenState, ReceiveFeedback, ShutdownContext,
    ShutdownState,
};
use crate::timer as fallback;
use crate::{
    Endpoint, Error, FlowControlMode, FlowControlType, ReceiveToken, SendToken, ShutdownMode,
    ShutdownOrigin, ShutdownType, Transport,
};

#[cfg(target_os = "linux")]
const SEND_BUFFER_REFRESH_INTERVAL: usize = 100;
#[cfg(target_os = "linux")]
const SEND_BUFFER_REFRESH_SIZE_THRESHOLD: usize = 16 * 1024;

/// Announcements accumulated under the socket mutex and fired after it
/// is released. Deferred items go to the strand in order; the rest run
/// inline.
struct Announcer {
    items: Vec<(bool, Functor)>,
}

impl Announcer {
    fn new() -> Self {
        Self { items: Vec::new() }
    }

    fn push(&mut self, defer: bool, f: impl FnOnce() + Send + 'static) {
        self.items.push((defer, Box::new(f)));
    }

    fn push_functor(&mut self, defer: bool, f: Functor) {
        self.items.push((defer, f));
    }

    fn fire(self, strand: &Arc<dyn Executor>) {
        for (defer, f) in self.items {
            if defer {
                strand.execute(f);
            } else {
                f();
            }
        }
    }
}

/// The continuation parked in the single deferred-call slot while an
/// asynchronous detach is in flight.
enum DeferredCall {
    FailConnectPart2 {
        callback: Option<ConnectCallback>,
        event: Option<ConnectEvent>,
        defer: bool,
    },
    ShutdownSequencePart2 {
        context: ShutdownContext,
    },
}

struct Inner {
    options: StreamSocketOptions,
    system: Option<Box<dyn SystemSocket>>,
    handle: Option<u64>,
    transport: Transport,
    source_endpoint: Option<Endpoint>,
    remote_endpoint: Option<Endpoint>,

    open_state: OpenState,
    flow_control: FlowControlState,
    shutdown_state: ShutdownState,
    detach_state: DetachState,

    send_queue: SendQueue,
    receive_queue: ReceiveQueue,
    receive_feedback: ReceiveFeedback,
    send_pending: bool,
    receive_pending: bool,
    #[allow(dead_code)]
    send_count: usize,
    send_max_bytes: usize,
    receive_max_bytes: usize,

    encryption: Option<Arc<Encryption>>,
    upgrade_in_progress: bool,
    upgrade_callback: Option<UpgradeCallback>,
    upgrade_timer: Option<Arc<dyn Timer>>,

    connect_in_progress: bool,
    connect_attempts: u64,
    retry_connect: bool,
    connect_name: Option<String>,
    connect_endpoint: Option<Endpoint>,
    connect_options: ConnectOptions,
    connect_callback: Option<ConnectCallback>,
    connect_context: ConnectContext,
    connect_start_time: Option<Instant>,
    connect_deadline_timer: Option<Arc<dyn Timer>>,
    connect_retry_timer: Option<Arc<dyn Timer>>,

    send_rate_limiter: Option<Arc<dyn RateLimiter>>,
    receive_rate_limiter: Option<Arc<dyn RateLimiter>>,
    send_rate_timer: Option<Arc<dyn Timer>>,
    receive_rate_timer: Option<Arc<dyn Timer>>,

    deferred_call: Option<DeferredCall>,
    deferred_calls: VecDeque<Functor>,
    close_callback: Option<CloseCallback>,

    listener: Option<Arc<dyn SocketListener>>,
    manager: Option<Arc<dyn SocketManager>>,
}

/// An asynchronous, proactor-driven stream socket with an integrated
/// TLS session layer.
pub struct StreamSocket {
    log: Logger,
    weak_self: Weak<StreamSocket>,
    strand: Arc<dyn Executor>,
    proactor: Observer<dyn Proactor>,
    proactor_pool: Observer<dyn ProactorPool>,
    resolver: Observer<dyn Resolver>,
    inner: Mutex<Inner>,
}

fn make_timer(
    socket: &Arc<StreamSocket>,
    one_shot: bool,
    handler: impl Fn(&Arc<StreamSocket>, &TimerEvent) + Send + Sync + 'static,
) -> Arc<dyn Timer> {
    let weak = socket.weak_self.clone();
    let callback: TimerCallback = Arc::new(move |event: &TimerEvent| {
        if let Some(socket) = weak.upgrade() {
            handler(&socket, event);
        }
    });
    socket.create_timer_internal(
        TimerOptions {
            one_shot,
            ..TimerOptions::default()
        },
        callback,
    )
}

fn dispatch_receive(
    entry: &Arc<ReceiveCallbackEntry>,
    socket: &Arc<StreamSocket>,
    announcer: &mut Announcer,
    defer: bool,
    data: Option<Bytes>,
    event: ReceiveEvent,
) {
    if let Some(callback) = entry.take() {
        let socket = socket.clone();
        announcer.push(defer, move || callback(&socket, data, event));
    }
}

fn directions(direction: FlowControlType) -> (bool, bool) {
    match direction {
        FlowControlType::Send => (true, false),
        FlowControlType::Receive => (false, true),
        FlowControlType::Both => (true, true),
    }
}

impl StreamSocket {
    /// Create a socket bound to `proactor` for its I/O, holding weak
    /// back-references to the proactor, its pool, and the resolver.
    pub fn new(
        log: Logger,
        options: StreamSocketOptions,
        proactor: &Arc<dyn Proactor>,
        proactor_pool: Option<&Arc<dyn ProactorPool>>,
        resolver: Option<&Arc<dyn Resolver>>,
    ) -> Arc<StreamSocket> {
        let strand = proactor.create_strand();
        let transport = options.transport;
        let send_queue = SendQueue::new(
            options.write_queue_low_watermark,
            options.write_queue_high_watermark,
        );
        let receive_queue = ReceiveQueue::new(
            options.read_queue_low_watermark,
            options.read_queue_high_watermark,
        );
        let receive_max_bytes = options.max_incoming_stream_transfer_size;
        let socket = Arc::new_cyclic(|weak: &Weak<StreamSocket>| StreamSocket {
            log,
            weak_self: weak.clone(),
            strand,
            proactor: Observer::new(),
            proactor_pool: Observer::new(),
            resolver: Observer::new(),
            inner: Mutex::new(Inner {
                options,
                system: None,
                handle: None,
                transport,
                source_endpoint: None,
                remote_endpoint: None,
                open_state: OpenState::Default,
                flow_control: FlowControlState::new(),
                shutdown_state: ShutdownState::new(),
                detach_state: DetachState::Idle,
                send_queue,
                receive_queue,
                receive_feedback: ReceiveFeedback::new(),
                send_pending: false,
                receive_pending: false,
                send_count: 0,
                send_max_bytes: 64 * 1024,
                receive_max_bytes,
                encryption: None,
                upgrade_in_progress: false,
                upgrade_callback: None,
                upgrade_timer: None,
                connect_in_progress: false,
                connect_attempts: 0,
                retry_connect: false,
                connect_name: None,
                connect_endpoint: None,
                connect_options: ConnectOptions::default(),
                connect_callback: None,
                connect_context: ConnectContext::default(),
                connect_start_time: None,
                connect_deadline_timer: None,
                connect_retry_timer: None,
                send_rate_limiter: None,
                receive_rate_limiter: None,
                send_rate_timer: None,
                receive_rate_timer: None,
                deferred_call: None,
                deferred_calls: VecDeque::new(),
                close_callback: None,
                listener: None,
                manager: None,
            }),
        });
        socket.proactor.watch(proactor);
        if let Some(pool) = proactor_pool {
            socket.proactor_pool.watch(pool);
        }
        if let Some(resolver) = resolver {
            socket.resolver.watch(resolver);
        }
        socket
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn get_self(&self) -> Option<Arc<StreamSocket>> {
        self.weak_self.upgrade()
    }

    /// Run `f` under the socket mutex with a strong self-reference,
    /// then fire the accumulated announcements outside the lock.
    fn enter<R>(&self, f: impl FnOnce(&mut Inner, &Arc<StreamSocket>, &mut Announcer) -> R) -> Option<R> {
        let socket = self.get_self()?;
        let mut announcer = Announcer::new();
        let result = {
            let mut inner = self.lock();
            f(&mut inner, &socket, &mut announcer)
        };
        announcer.fire(&self.strand);
        Some(result)
    }

    fn create_timer_internal(&self, options: TimerOptions, callback: TimerCallback) -> Arc<dyn Timer> {
        match self.proactor.get() {
            Some(proactor) => proactor.create_timer(options, callback),
            None => fallback::create_timer(options, callback),
        }
    }

    /// Create a timer on the proactor, falling back to the process-wide
    /// service when the proactor is gone.
    pub fn create_timer(&self, options: TimerOptions, callback: TimerCallback) -> Arc<dyn Timer> {
        self.create_timer_internal(options, callback)
    }

    /// Run `f` on the socket's strand.
    pub fn execute(&self, f: Functor) {
        self.strand.execute(f);
    }

    pub fn strand(&self) -> Arc<dyn Executor> {
        self.strand.clone()
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Create the native socket, apply configured options, and register
    /// with the proactor.
    pub fn open(&self) -> Result<(), Error> {
        let transport = self.lock().options.transport;
        self.enter(|inner, socket, announcer| inner.private_open(socket, transport, None, announcer))
            .unwrap_or(Err(Error::Invalid))
    }

    /// Adopt an existing native socket, typically one produced by an
    /// acceptor. A connected handle transitions straight to
    /// `Connected` and announces establishment.
    pub fn adopt(
        &self,
        transport: Transport,
        system: Box<dyn SystemSocket>,
    ) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            inner.private_open(socket, transport, Some(system), announcer)
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Bind to `endpoint`, reading back the effective source endpoint.
    /// The callback, when present, observes the outcome as a
    /// [`BindEvent`].
    pub fn bind(
        &self,
        endpoint: &Endpoint,
        options: &BindOptions,
        callback: Option<BindCallback>,
    ) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            let result = inner.bind_endpoint(socket, endpoint, announcer);
            let mut context = BindContext::default();
            let event = match result {
                Ok(source) => {
                    context.endpoint = Some(source);
                    BindEvent::Complete(context)
                }
                Err(error) => {
                    context.error = Some(error);
                    BindEvent::Error(context)
                }
            };
            match callback {
                Some(callback) => {
                    let socket = socket.clone();
                    let defer = !options.recurse;
                    announcer.push(defer, move || callback(&socket, event));
                    Ok(())
                }
                None => match event {
                    BindEvent::Error(context) => Err(context.error.unwrap_or(Error::Invalid)),
                    BindEvent::Complete(_) => Ok(()),
                },
            }
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Resolve `name` and bind to the resulting endpoint. Local-stream
    /// transports and absolute paths bypass the resolver.
    pub fn bind_name(
        &self,
        name: &str,
        options: &BindOptions,
        callback: Option<BindCallback>,
    ) -> Result<(), Error> {
        let local = {
            let inner = self.lock();
            inner.options.transport == Transport::LocalStream
        } || Path::new(name).is_absolute();
        if local {
            return self.bind(&Endpoint::Local(name.into()), options, callback);
        }
        let resolver = self.resolver.get().ok_or(Error::Invalid)?;
        let weak = self.weak_self.clone();
        let get_options = GetEndpointOptions {
            transport: Some(self.lock().options.transport),
        };
        let bind_options = *options;
        let authority = name.to_string();
        resolver.get_endpoint(
            name,
            &get_options,
            Box::new(move |endpoint, event| {
                let socket = match weak.upgrade() {
                    Some(socket) => socket,
                    None => return,
                };
                match endpoint {
                    Some(endpoint) => {
                        let _ = socket.bind(&endpoint, &bind_options, callback);
                    }
                    None => {
                        if let Some(callback) = callback {
                            callback(
                                &socket,
                                BindEvent::Error(BindContext {
                                    error: event.error.or(Some(Error::Invalid)),
                                    name: Some(authority),
                                    endpoint: None,
                                }),
                            );
                        }
                    }
                }
            }),
        )
    }

    /// Connect to `endpoint`. The callback fires exactly once with the
    /// terminal outcome; recoverable failures with retries remaining
    /// are retried internally without surfacing events.
    pub fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
        callback: ConnectCallback,
    ) -> Result<(), Error> {
        if endpoint.is_ip() && endpoint.is_undefined_target() {
            return Err(Error::Invalid);
        }
        self.enter(|inner, socket, _announcer| {
            inner.connect_begin(socket, Some(endpoint.clone()), None, options, callback)
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Connect to a name, re-resolving on every attempt. Local-stream
    /// transports and absolute paths connect directly.
    pub fn connect_name(
        &self,
        name: &str,
        options: &ConnectOptions,
        callback: ConnectCallback,
    ) -> Result<(), Error> {
        let local = {
            let inner = self.lock();
            inner.options.transport == Transport::LocalStream
        } || Path::new(name).is_absolute();
        if local {
            return self.connect(&Endpoint::Local(name.into()), options, callback);
        }
        if self.resolver.get().is_none() {
            return Err(Error::Invalid);
        }
        self.enter(|inner, socket, _announcer| {
            inner.connect_begin(socket, None, Some(name.to_string()), options, callback)
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Install `encryption` and initiate the TLS handshake over the
    /// established connection.
    pub fn upgrade(
        &self,
        encryption: &Arc<Encryption>,
        options: &UpgradeOptions,
        callback: Option<UpgradeCallback>,
    ) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            if !inner.open_state.can_send() || !inner.open_state.can_receive() {
                return Err(Error::Invalid);
            }
            if inner.upgrade_in_progress || inner.encryption.is_some() {
                return Err(Error::Invalid);
            }
            inner.encryption = Some(encryption.clone());
            inner.upgrade_callback = callback;
            inner.upgrade_in_progress = true;
            if let Err(error) = inner.private_upgrade(socket, options, announcer) {
                inner.encryption = None;
                inner.upgrade_callback = None;
                inner.upgrade_in_progress = false;
                let _ = inner.private_shutdown(
                    socket,
                    ShutdownType::Both,
                    ShutdownMode::Immediate,
                    announcer,
                );
                return Err(error);
            }
            if inner.upgrade_in_progress {
                if let Some(deadline) = options.deadline {
                    let timer = make_timer(socket, true, |socket, event| {
                        socket.process_upgrade_timer(event);
                    });
                    let _ = timer.schedule(deadline, None);
                    inner.upgrade_timer = Some(timer);
                }
            }
            inner.private_relax_flow_control(
                socket,
                FlowControlType::Receive,
                true,
                false,
                announcer,
            );
            Ok(())
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Queue `data` for ordered transmission. Fails with `WouldBlock`,
    /// announcing a high-watermark event at most once per breach, when
    /// the write queue cannot grow past the effective high watermark.
    pub fn send(
        &self,
        data: Bytes,
        options: &SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            if !inner.open_state.can_send() {
                return Err(Error::Invalid);
            }
            let effective_high = options
                .high_watermark
                .unwrap_or_else(|| inner.send_queue.high_watermark());
            if inner
                .send_queue
                .is_high_watermark_violated_by(data.len(), effective_high)
            {
                if inner.send_queue.authorize_high_watermark_event() {
                    warn!(socket.log, "write queue high watermark breached";
                        "size" => inner.send_queue.size(),
                        "high_watermark" => effective_high);
                    let context = inner.send_queue.context();
                    inner.announce_write_event(
                        socket,
                        announcer,
                        true,
                        WriteQueueEvent::HighWatermark(context),
                    );
                }
                return Err(Error::WouldBlock);
            }
            match inner.encryption.clone() {
                None => inner.private_send_raw(socket, data, options, callback, announcer),
                Some(encryption) => {
                    encryption.push_outgoing_plain_text(&data)?;
                    let mut cipher = BytesMut::new();
                    while encryption.has_outgoing_cipher_text() {
                        encryption.pop_outgoing_cipher_text(&mut cipher)?;
                    }
                    if !cipher.is_empty() {
                        inner.private_send_raw(
                            socket,
                            cipher.freeze(),
                            options,
                            callback,
                            announcer,
                        )
                    } else {
                        // Common during the handshake: the payload was
                        // absorbed without producing records yet.
                        if let Some(callback) = callback {
                            let defer = !options.recurse;
                            let socket = socket.clone();
                            announcer.push(defer, move || {
                                callback(&socket, SendEvent::Complete(SendContext::default()));
                            });
                        }
                        Ok(())
                    }
                }
            }
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Synchronously dequeue between `min_size` and `max_size` bytes.
    /// Returns `WouldBlock`, relaxing receive flow control, when not
    /// enough bytes are queued; `Eof` after a remote half-close drained
    /// the queue.
    pub fn receive(&self, options: &ReceiveOptions) -> Result<Bytes, Error> {
        self.enter(|inner, socket, announcer| {
            if !inner.open_state.can_receive() {
                return Err(Error::Invalid);
            }
            if inner.receive_queue.size() == 0 && !inner.shutdown_state.can_receive() {
                return Err(Error::Eof);
            }
            if inner.receive_queue.size() >= options.min_size {
                let violated_before = inner.receive_queue.is_high_watermark_violated();
                let data = inner.receive_queue.dequeue(options.max_size);
                trace!(socket.log, "read queue drained"; "size" => inner.receive_queue.size());
                let violated_after = inner.receive_queue.is_high_watermark_violated();
                if violated_before && !violated_after {
                    inner.private_relax_flow_control(
                        socket,
                        FlowControlType::Receive,
                        true,
                        false,
                        announcer,
                    );
                }
                Ok(data)
            } else {
                inner.private_relax_flow_control(
                    socket,
                    FlowControlType::Receive,
                    true,
                    false,
                    announcer,
                );
                Err(Error::WouldBlock)
            }
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Register a pending read satisfied once at least `min_size` bytes
    /// are available, optionally armed with a deadline.
    pub fn receive_async(
        &self,
        options: &ReceiveOptions,
        callback: ReceiveCallback,
    ) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            if !inner.open_state.can_receive() {
                return Err(Error::Invalid);
            }
            if inner.receive_queue.size() == 0 && !inner.shutdown_state.can_receive() {
                return Err(Error::Eof);
            }
            let entry = ReceiveCallbackEntry::new(callback, *options);
            if !inner.receive_queue.has_callback_entry()
                && inner.receive_queue.size() >= options.min_size
            {
                let violated_before = inner.receive_queue.is_high_watermark_violated();
                let data = inner.receive_queue.dequeue(options.max_size);
                trace!(socket.log, "read queue drained"; "size" => inner.receive_queue.size());
                let event = ReceiveEvent::Complete(inner.receive_context(None));
                let defer = !options.recurse;
                dispatch_receive(&entry, socket, announcer, defer, Some(data), event);
                let violated_after = inner.receive_queue.is_high_watermark_violated();
                if violated_before && !violated_after {
                    inner.private_relax_flow_control(
                        socket,
                        FlowControlType::Receive,
                        true,
                        false,
                        announcer,
                    );
                }
            } else {
                if let Some(deadline) = options.deadline {
                    let deadline_entry = entry.clone();
                    let timer = make_timer(socket, true, move |socket, event| {
                        socket.process_receive_deadline_timer(event, &deadline_entry);
                    });
                    let _ = timer.schedule(deadline, None);
                    entry.set_timer(timer);
                }
                inner.receive_queue.push_callback_entry(entry);
                inner.private_relax_flow_control(
                    socket,
                    FlowControlType::Receive,
                    true,
                    false,
                    announcer,
                );
            }
            Ok(())
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Shut down one or both directions. Deferred while a detach is in
    /// flight; cancels an in-progress connect when the send direction
    /// is included.
    pub fn shutdown(&self, direction: ShutdownType, mode: ShutdownMode) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            if inner.detach_state == DetachState::DetachInitiated {
                let socket = socket.clone();
                inner.deferred_calls.push_back(Box::new(move || {
                    let _ = socket.shutdown(direction, mode);
                }));
                return Ok(());
            }
            if inner.connect_in_progress {
                if direction == ShutdownType::Send || direction == ShutdownType::Both {
                    inner.private_fail_connect(socket, Error::Cancelled, true, true, announcer);
                }
                Ok(())
            } else {
                inner.private_shutdown(socket, direction, mode, announcer)
            }
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Shut down both directions immediately. The callback fires
    /// exactly once when the socket has fully closed.
    pub fn close(&self, callback: Option<CloseCallback>) {
        self.enter(|inner, socket, announcer| {
            if inner.detach_state == DetachState::DetachInitiated {
                let socket = socket.clone();
                inner.deferred_calls.push_back(Box::new(move || {
                    socket.close(callback);
                }));
                return;
            }
            debug_assert!(inner.close_callback.is_none());
            inner.close_callback = callback;
            if inner.connect_in_progress {
                inner.private_fail_connect(socket, Error::Cancelled, true, true, announcer);
            } else {
                let _ = inner.private_shutdown(
                    socket,
                    ShutdownType::Both,
                    ShutdownMode::Immediate,
                    announcer,
                );
            }
        });
    }

    /// Initiate the TLS close-notify exchange, transitioning the
    /// connection back to plaintext once the peer responds.
    pub fn downgrade(&self) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            let encryption = match inner.encryption.clone() {
                Some(encryption) => encryption,
                None => return Err(Error::Invalid),
            };
            if encryption.is_shutdown_sent() {
                return Ok(());
            }
            encryption.shutdown()?;
            if !encryption.is_shutdown_received() {
                inner.announce_downgrade(socket, announcer, true, DowngradeEvent::Initiated);
            }
            inner.flush_encryption_output(socket, announcer)?;
            if encryption.is_shutdown_finished() {
                inner.encryption = None;
                inner.announce_downgrade(socket, announcer, true, DowngradeEvent::Complete);
            }
            Ok(())
        })
        .unwrap_or(Err(Error::Invalid))
    }

    // ---------------------------------------------------------------
    // Cancellation
    // ---------------------------------------------------------------

    pub fn cancel_bind(&self) -> Result<(), Error> {
        Err(Error::NotImplemented)
    }

    /// Cancel an in-progress connect, failing it terminally with
    /// `Cancelled`.
    pub fn cancel_connect(&self) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            if inner.connect_in_progress {
                inner.private_fail_connect(socket, Error::Cancelled, false, true, announcer);
                Ok(())
            } else {
                Err(Error::Invalid)
            }
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Abort an in-progress upgrade with `Cancelled`, then fail the
    /// socket.
    pub fn cancel_upgrade(&self) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            if !inner.upgrade_in_progress {
                return Err(Error::Invalid);
            }
            inner.upgrade_in_progress = false;
            inner.encryption = None;
            let callback = inner.upgrade_callback.take();
            if let Some(timer) = inner.upgrade_timer.take() {
                timer.close();
            }
            if let Some(callback) = callback {
                let socket = socket.clone();
                announcer.push(true, move || {
                    callback(
                        &socket,
                        UpgradeEvent::Error(UpgradeContext {
                            error: Some(Error::Cancelled),
                            error_description: String::new(),
                        }),
                    );
                });
            }
            inner.private_fail(socket, Error::Cancelled, announcer);
            Ok(())
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Remove the send-queue entry with the matching token and dispatch
    /// its callback with `Cancelled`.
    pub fn cancel_send(&self, token: SendToken) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            let (entry, became_empty) = inner.send_queue.remove_token(token);
            if became_empty {
                let _ = inner.private_apply_flow_control(
                    socket,
                    FlowControlType::Send,
                    FlowControlMode::Immediate,
                    true,
                    false,
                    announcer,
                );
            }
            match entry {
                Some(mut entry) => {
                    entry.close_timer();
                    if let Some(callback) = entry.callback.take() {
                        let socket = socket.clone();
                        announcer.push(true, move || {
                            callback(
                                &socket,
                                SendEvent::Error(SendContext {
                                    error: Some(Error::Cancelled),
                                }),
                            );
                        });
                    }
                    Ok(())
                }
                None => Err(Error::Invalid),
            }
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Remove the pending receive with the matching token and dispatch
    /// its callback with `Cancelled`.
    pub fn cancel_receive(&self, token: ReceiveToken) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            match inner.receive_queue.remove_callback_token(token) {
                Some(entry) => {
                    let event = ReceiveEvent::Error(inner.receive_context(Some(Error::Cancelled)));
                    dispatch_receive(&entry, socket, announcer, true, None, event);
                    Ok(())
                }
                None => Err(Error::Invalid),
            }
        })
        .unwrap_or(Err(Error::Invalid))
    }

    // ---------------------------------------------------------------
    // Flow control and tuning
    // ---------------------------------------------------------------

    /// Re-enable the issuance of transfers in `direction`, releasing
    /// the internal throttle lock.
    pub fn relax_flow_control(&self, direction: FlowControlType) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            inner.private_relax_flow_control(socket, direction, true, true, announcer);
            Ok(())
        })
        .unwrap_or(Err(Error::Invalid))
    }

    /// Disable the issuance of transfers in `direction`, locking the
    /// direction against non-unlocking relaxes.
    pub fn apply_flow_control(
        &self,
        direction: FlowControlType,
        mode: FlowControlMode,
    ) -> Result<(), Error> {
        self.enter(|inner, socket, announcer| {
            if direction == FlowControlType::Send || direction == FlowControlType::Both {
                if let Some(timer) = inner.send_rate_timer.take() {
                    timer.close();
                }
            }
            if direction == FlowControlType::Receive || direction == FlowControlType::Both {
                if let Some(timer) = inner.receive_rate_timer.take() {
                    timer.close();
                }
            }
            inner.private_apply_flow_control(socket, direction, mode, true, true, announcer)
        })
        .unwrap_or(Err(Error::Invalid))
    }

    pub fn set_write_rate_limiter(&self, limiter: Option<Arc<dyn RateLimiter>>) {
        self.enter(|inner, socket, announcer| {
            inner.send_rate_limiter = limiter;
            if inner.send_rate_limiter.is_none() {
                if let Some(timer) = inner.send_rate_timer.take() {
                    timer.close();
                }
                inner.private_relax_flow_control(
                    socket,
                    FlowControlType::Send,
                    true,
                    true,
                    announcer,
                );
            }
        });
    }

    pub fn set_read_rate_limiter(&self, limiter: Option<Arc<dyn RateLimiter>>) {
        self.enter(|inner, socket, announcer| {
            inner.receive_rate_limiter = limiter;
            if inner.receive_rate_limiter.is_none() {
                if let Some(timer) = inner.receive_rate_timer.take() {
                    timer.close();
                }
                inner.private_relax_flow_control(
                    socket,
                    FlowControlType::Receive,
                    true,
                    true,
                    announcer,
                );
            }
        });
    }

    pub fn set_write_queue_low_watermark(&self, low_watermark: usize) {
        self.enter(|inner, socket, announcer| {
            inner.send_queue.set_low_watermark(low_watermark);
            if inner.send_queue.authorize_low_watermark_event() {
                let context = inner.send_queue.context();
                inner.announce_write_event(
                    socket,
                    announcer,
                    true,
                    WriteQueueEvent::LowWatermark(context),
                );
            }
        });
    }

    pub fn set_write_queue_high_watermark(&self, high_watermark: usize) {
        self.enter(|inner, socket, announcer| {
            inner.send_queue.set_high_watermark(high_watermark);
            if inner
                .send_queue
                .is_high_watermark_violated_by(0, high_watermark)
                && inner.send_queue.authorize_high_watermark_event()
            {
                let context = inner.send_queue.context();
                inner.announce_write_event(
                    socket,
                    announcer,
                    true,
                    WriteQueueEvent::HighWatermark(context),
                );
            }
        });
    }

    pub fn set_write_queue_watermarks(&self, low_watermark: usize, high_watermark: usize) {
        self.set_write_queue_low_watermark(low_watermark);
        self.set_write_queue_high_watermark(high_watermark);
    }

    pub fn set_read_queue_low_watermark(&self, low_watermark: usize) {
        self.enter(|inner, socket, announcer| {
            inner.receive_queue.set_low_watermark(low_watermark);
            if !inner.receive_queue.is_low_watermark_satisfied() {
                inner.private_relax_flow_control(
                    socket,
                    FlowControlType::Receive,
                    true,
                    false,
                    announcer,
                );
            } else if inner.receive_queue.authorize_low_watermark_event() {
                let context = inner.receive_queue.context();
                inner.announce_read_event(
                    socket,
                    announcer,
                    true,
                    ReadQueueEvent::LowWatermark(context),
                );
            }
        });
    }

    pub fn set_read_queue_high_watermark(&self, high_watermark: usize) {
        self.enter(|inner, socket, announcer| {
            inner.receive_queue.set_high_watermark(high_watermark);
            if inner.receive_queue.is_high_watermark_violated() {
                let _ = inner.private_apply_flow_control(
                    socket,
                    FlowControlType::Receive,
                    FlowControlMode::Immediate,
                    true,
                    false,
                    announcer,
                );
            }
        });
    }

    pub fn set_read_queue_watermarks(&self, low_watermark: usize, high_watermark: usize) {
        self.set_read_queue_low_watermark(low_watermark);
        self.set_read_queue_high_watermark(high_watermark);
    }

    // ---------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------

    pub fn register_listener(&self, listener: Arc<dyn SocketListener>) {
        self.lock().listener = Some(listener);
    }

    pub fn deregister_listener(&self) {
        self.lock().listener = None;
    }

    /// Register the manager, immediately announcing `established` or
    /// `closed` when the socket is already in that state.
    pub fn register_manager(&self, manager: Arc<dyn SocketManager>) {
        self.enter(|inner, socket, announcer| {
            inner.manager = Some(manager);
            match inner.open_state {
                OpenState::Connected => inner.announce_established(socket, announcer, true),
                OpenState::Closed => inner.announce_closed(socket, announcer, true),
                _ => {}
            }
        });
    }

    pub fn deregister_manager(&self) {
        self.lock().manager = None;
    }

    pub fn register_resolver(&self, resolver: &Arc<dyn Resolver>) {
        self.resolver.watch(resolver);
    }

    pub fn deregister_resolver(&self) {
        self.resolver.reset();
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    pub fn handle(&self) -> Option<u64> {
        self.lock().handle
    }

    pub fn transport(&self) -> Transport {
        self.lock().transport
    }

    pub fn source_endpoint(&self) -> Option<Endpoint> {
        self.lock().source_endpoint.clone()
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.lock().remote_endpoint.clone()
    }

    pub fn encryption(&self) -> Option<Arc<Encryption>> {
        self.lock().encryption.clone()
    }

    pub fn source_certificate(&self) -> Option<crate::session::EncryptionCertificate> {
        self.lock()
            .encryption
            .as_ref()
            .and_then(|encryption| encryption.source_certificate())
    }

    pub fn remote_certificate(&self) -> Option<crate::session::EncryptionCertificate> {
        self.lock()
            .encryption
            .as_ref()
            .and_then(|encryption| encryption.remote_certificate())
    }

    pub fn read_queue_size(&self) -> usize {
        self.lock().receive_queue.size()
    }

    pub fn read_queue_low_watermark(&self) -> usize {
        self.lock().receive_queue.low_watermark()
    }

    pub fn read_queue_high_watermark(&self) -> usize {
        self.lock().receive_queue.high_watermark()
    }

    pub fn write_queue_size(&self) -> usize {
        self.lock().send_queue.size()
    }

    pub fn write_queue_low_watermark(&self) -> usize {
        self.lock().send_queue.low_watermark()
    }

    pub fn write_queue_high_watermark(&self) -> usize {
        self.lock().send_queue.high_watermark()
    }

    // ---------------------------------------------------------------
    // Proactor completion entry points
    // ---------------------------------------------------------------

    /// The asynchronous connect completed.
    pub fn process_socket_connected(&self, result: Result<(), Error>) {
        self.enter(|inner, socket, announcer| {
            if inner.detach_state == DetachState::DetachInitiated {
                return;
            }
            match result {
                Err(Error::Cancelled) => {}
                Err(error) => inner.private_fail_connect(socket, error, false, false, announcer),
                Ok(()) => inner.private_complete_connect(socket, announcer),
            }
        });
    }

    /// One proactor send completed, having drained `result` bytes of
    /// the queue head.
    pub fn process_socket_sent(&self, result: Result<usize, Error>) {
        self.enter(|inner, socket, announcer| {
            if inner.detach_state == DetachState::DetachInitiated {
                return;
            }
            inner.send_pending = false;
            match result {
                Err(Error::Cancelled) => {}
                Err(error) => {
                    debug!(socket.log, "send failed"; "error" => %error);
                    inner.private_fail_send(socket, error, announcer);
                }
                Ok(sent) => inner.private_complete_send(socket, sent, announcer),
            }
            inner.private_initiate_send(socket, announcer);
        });
    }

    /// One proactor receive completed. An empty buffer means the peer
    /// shut down its write side.
    pub fn process_socket_received(&self, attempted: usize, result: Result<Bytes, Error>) {
        self.enter(|inner, socket, announcer| {
            if inner.detach_state == DetachState::DetachInitiated {
                return;
            }
            inner.receive_pending = false;
            match result {
                Err(Error::Cancelled) => {}
                Err(error) => {
                    debug!(socket.log, "receive failed"; "error" => %error);
                    inner.private_fail(socket, error, announcer);
                }
                Ok(data) => inner.private_complete_receive(socket, attempted, data, announcer),
            }
            inner.private_initiate_receive(socket, announcer);
        });
    }

    /// The proactor observed an error on the socket. While a detach is
    /// in flight the error is enqueued as a deferred call.
    pub fn process_socket_error(&self, error: Error) {
        self.enter(|inner, socket, announcer| {
            if inner.detach_state == DetachState::DetachInitiated {
                let socket = socket.clone();
                inner.deferred_calls.push_back(Box::new(move || {
                    socket.process_socket_error(error);
                }));
                return;
            }
            inner.private_fail(socket, error, announcer);
        });
    }

    /// The asynchronous detach completed; run the parked continuation.
    pub fn process_socket_detached(&self) {
        self.enter(|inner, socket, announcer| {
            debug_assert_eq!(inner.detach_state, DetachState::DetachInitiated);
            inner.detach_state = DetachState::Idle;
            match inner.deferred_call.take() {
                Some(DeferredCall::FailConnectPart2 {
                    callback,
                    event,
                    defer,
                }) => {
                    inner.private_fail_connect_part2(socket, callback, event, defer, announcer);
                }
                Some(DeferredCall::ShutdownSequencePart2 { context }) => {
                    inner.private_shutdown_sequence_part2(socket, &context, announcer);
                }
                None => {}
            }
        });
    }

    // ---------------------------------------------------------------
    // Timer entry points
    // ---------------------------------------------------------------

    fn process_connect_retry_timer(&self, event: &TimerEvent) {
        if event.kind != TimerEventType::Deadline {
            return;
        }
        self.enter(|inner, socket, announcer| {
            if !inner.connect_in_progress {
                return;
            }
            if inner.connect_attempts > 0 {
                // The retry dispatched in fail-connect part 2 once the
                // previous attempt has been torn down.
                inner.retry_connect = true;
                if inner.detach_state != DetachState::DetachInitiated {
                    inner.private_fail_connect(
                        socket,
                        Error::ConnectionTimeout,
                        false,
                        false,
                        announcer,
                    );
                }
            } else {
                inner.private_retry_connect(socket, announcer);
            }
        });
    }

    fn process_connect_deadline_timer(&self, event: &TimerEvent) {
        if event.kind != TimerEventType::Deadline {
            return;
        }
        self.enter(|inner, socket, announcer| {
            if inner.detach_state == DetachState::DetachInitiated {
                inner.retry_connect = false;
                let socket = socket.clone();
                let event = *event;
                inner.deferred_calls.push_back(Box::new(move || {
                    socket.process_connect_deadline_timer(&event);
                }));
                return;
            }
            if inner.connect_in_progress {
                inner.private_fail_connect(
                    socket,
                    Error::ConnectionTimeout,
                    false,
                    true,
                    announcer,
                );
            }
        });
    }

    fn process_upgrade_timer(&self, event: &TimerEvent) {
        if event.kind != TimerEventType::Deadline {
            return;
        }
        self.enter(|inner, socket, announcer| {
            if inner.upgrade_in_progress {
                inner.private_fail_upgrade(
                    socket,
                    Error::WouldBlock,
                    "the operation has timed out".into(),
                    announcer,
                );
            }
        });
    }

    fn process_send_rate_timer(&self, event: &TimerEvent) {
        if event.kind != TimerEventType::Deadline {
            return;
        }
        self.enter(|inner, socket, announcer| {
            trace!(socket.log, "write rate limit relaxed");
            inner.private_relax_flow_control(socket, FlowControlType::Send, false, true, announcer);
            let context = inner.send_queue.context();
            inner.announce_write_event(
                socket,
                announcer,
                false,
                WriteQueueEvent::RateLimitRelaxed(context),
            );
        });
    }

    fn process_receive_rate_timer(&self, event: &TimerEvent) {
        if event.kind != TimerEventType::Deadline {
            return;
        }
        self.enter(|inner, socket, announcer| {
            trace!(socket.log, "read rate limit relaxed");
            inner.private_relax_flow_control(
                socket,
                FlowControlType::Receive,
                false,
                true,
                announcer,
            );
            let context = inner.receive_queue.context();
            inner.announce_read_event(
                socket,
                announcer,
                false,
                ReadQueueEvent::RateLimitRelaxed(context),
            );
        });
    }

    fn process_send_deadline_timer(&self, event: &TimerEvent, entry_id: u64) {
        if event.kind != TimerEventType::Deadline {
            return;
        }
        self.enter(|inner, socket, announcer| {
            let (entry, became_empty) = inner.send_queue.remove_id(entry_id);
            if became_empty {
                let _ = inner.private_apply_flow_control(
                    socket,
                    FlowControlType::Send,
                    FlowControlMode::Immediate,
                    false,
                    false,
                    announcer,
                );
            }
            if let Some(mut entry) = entry {
                entry.close_timer();
                if let Some(callback) = entry.callback.take() {
                    let socket = socket.clone();
                    announcer.push(false, move || {
                        callback(
                            &socket,
                            SendEvent::Error(SendContext {
                                error: Some(Error::WouldBlock),
                            }),
                        );
                    });
                }
            }
        });
    }

    fn process_receive_deadline_timer(&self, event: &TimerEvent, entry: &Arc<ReceiveCallbackEntry>) {
        if event.kind != TimerEventType::Deadline {
            return;
        }
        self.enter(|inner, socket, announcer| {
            if inner.receive_queue.remove_callback_entry(entry) {
                let event = ReceiveEvent::Error(inner.receive_context(Some(Error::WouldBlock)));
                dispatch_receive(entry, socket, announcer, false, None, event);
            }
        });
    }

    /// The resolver produced an endpoint for a connect-by-name attempt.
    /// Stale results, identified by their attempt sequence number, are
    /// discarded.
    fn process_remote_endpoint_resolution(
        &self,
        endpoint: Option<Endpoint>,
        event: crate::proactor::GetEndpointEvent,
        attempts: u64,
    ) {
        self.enter(|inner, socket, announcer| {
            if inner.detach_state == DetachState::DetachInitiated {
                return;
            }
            if !inner.connect_in_progress {
                trace!(socket.log, "ignored stale endpoint resolution";
                    "reason" => "no connect in progress");
                return;
            }
            if attempts != inner.connect_attempts {
                trace!(socket.log, "ignored stale endpoint resolution";
                    "resolved_attempt" => attempts,
                    "current_attempt" => inner.connect_attempts);
                return;
            }
            if event.error.is_none() {
                if inner.connect_context.name.is_none() {
                    inner.connect_context.name = event.authority.clone();
                }
                inner.connect_context.endpoint = endpoint.clone();
                inner.connect_context.latency = event.latency;
                inner.connect_context.name_server = event.name_server.clone();
                inner.connect_context.source = Some(event.source);
            }
            let result = match (event.error, endpoint) {
                (Some(error), _) => Err(error),
                (None, None) => Err(Error::Invalid),
                (None, Some(endpoint)) => inner.connect_to_resolved(socket, &endpoint),
            };
            if let Err(error) = result {
                inner.private_fail_connect(socket, error, false, false, announcer);
            }
        });
    }
}

impl Inner {
    // ---------------------------------------------------------------
    // Announcement helpers
    // ---------------------------------------------------------------

    fn announce_write_event(
        &self,
        socket: &Arc<StreamSocket>,
        announcer: &mut Announcer,
        defer: bool,
        event: WriteQueueEvent,
    ) {
        if let Some(listener) = self.listener.clone() {
            let socket = socket.clone();
            announcer.push(defer, move || listener.on_write_queue(&socket, event));
        }
    }

    fn announce_read_event(
        &self,
        socket: &Arc<StreamSocket>,
        announcer: &mut Announcer,
        defer: bool,
        event: ReadQueueEvent,
    ) {
        if let Some(listener) = self.listener.clone() {
            let socket = socket.clone();
            announcer.push(defer, move || listener.on_read_queue(&socket, event));
        }
    }

    fn announce_shutdown(
        &self,
        socket: &Arc<StreamSocket>,
        announcer: &mut Announcer,
        defer: bool,
        event: ShutdownEvent,
    ) {
        if let Some(listener) = self.listener.clone() {
            let socket = socket.clone();
            announcer.push(defer, move || listener.on_shutdown(&socket, event));
        }
    }

    fn announce_downgrade(
        &self,
        socket: &Arc<StreamSocket>,
        announcer: &mut Announcer,
        defer: bool,
        event: DowngradeEvent,
    ) {
        if let Some(listener) = self.listener.clone() {
            let socket = socket.clone();
            announcer.push(defer, move || listener.on_downgrade(&socket, event));
        }
    }

    fn announce_error(
        &self,
        socket: &Arc<StreamSocket>,
        announcer: &mut Announcer,
        defer: bool,
        event: ErrorEvent,
    ) {
        if let Some(listener) = self.listener.clone() {
            let socket = socket.clone();
            announcer.push(defer, move || listener.on_error(&socket, event));
        }
    }

    fn announce_established(
        &self,
        socket: &Arc<StreamSocket>,
        announcer: &mut Announcer,
        defer: bool,
    ) {
        if let Some(manager) = self.manager.clone() {
            let socket = socket.clone();
            announcer.push(defer, move || manager.on_established(&socket));
        }
    }

    fn announce_closed(&self, socket: &Arc<StreamSocket>, announcer: &mut Announcer, defer: bool) {
        if let Some(manager) = self.manager.clone() {
            let socket = socket.clone();
            announcer.push(defer, move || manager.on_closed(&socket));
        }
    }

    fn receive_context(&self, error: Option<Error>) -> ReceiveContext {
        ReceiveContext {
            error,
            transport: self.transport,
            endpoint: self.remote_endpoint.clone(),
        }
    }

    fn keep_half_open(&self) -> bool {
        if self.options.abortive_close {
            return false;
        }
        self.options.keep_half_open.unwrap_or(false)
    }

    // ---------------------------------------------------------------
    // Open
    // ---------------------------------------------------------------

    fn bind_endpoint(
        &mut self,
        socket: &Arc<StreamSocket>,
        endpoint: &Endpoint,
        announcer: &mut Announcer,
    ) -> Result<Endpoint, Error> {
        if self.handle.is_none() {
            self.private_open(socket, endpoint.transport(), None, announcer)?;
        }
        let reuse = self.options.reuse_address;
        let system = self.system.as_mut().ok_or(Error::Invalid)?;
        system.bind(endpoint, reuse)?;
        let source = system.source_endpoint()?;
        self.source_endpoint = Some(source.clone());
        Ok(source)
    }

    fn private_open(
        &mut self,
        socket: &Arc<StreamSocket>,
        transport: Transport,
        adopted: Option<Box<dyn SystemSocket>>,
        announcer: &mut Announcer,
    ) -> Result<(), Error> {
        if self.handle.is_some() {
            return Err(Error::Invalid);
        }
        if transport != self.options.transport {
            return Err(Error::Invalid);
        }
        let proactor = socket.proactor.get().ok_or(Error::Invalid)?;
        let mut system = match adopted {
            Some(system) => system,
            None => proactor.create_stream_socket(transport)?,
        };
        if let Some(source) = self.options.source_endpoint.clone() {
            system.bind(&source, self.options.reuse_address)?;
        }
        let source_endpoint = system.source_endpoint().ok();
        let remote_endpoint = system.remote_endpoint().ok();
        if let Ok(size) = system.send_buffer_size() {
            if size > 0 {
                self.send_max_bytes = size * 2;
            }
        }
        if let Ok(size) = system.receive_buffer_size() {
            if size > 0 {
                self.receive_max_bytes = size;
            }
        }
        if !proactor.acquire_handle_reservation() {
            return Err(Error::Limit);
        }
        self.handle = Some(system.handle());
        self.transport = transport;
        self.source_endpoint = source_endpoint;
        self.remote_endpoint = remote_endpoint.clone();
        self.system = Some(system);
        trace!(socket.log, "stream socket opened";
            "descriptor" => self.handle.unwrap_or(0));
        let _ = proactor.attach_socket(socket);
        if remote_endpoint.is_some() {
            self.open_state = OpenState::Connected;
            self.announce_established(socket, announcer, true);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Connect
    // ---------------------------------------------------------------

    fn connect_begin(
        &mut self,
        socket: &Arc<StreamSocket>,
        endpoint: Option<Endpoint>,
        name: Option<String>,
        options: &ConnectOptions,
        callback: ConnectCallback,
    ) -> Result<(), Error> {
        if !self.open_state.can_connect() {
            return Err(Error::Invalid);
        }
        if self.connect_in_progress {
            return Err(Error::Invalid);
        }
        if self.remote_endpoint.is_some() {
            return Err(Error::Invalid);
        }
        self.connect_endpoint = endpoint;
        self.connect_name = name;
        self.connect_options = options.clone();
        self.connect_callback = Some(callback);
        self.connect_context = ConnectContext::default();
        self.connect_in_progress = true;
        self.connect_attempts = 0;
        self.retry_connect = false;
        self.open_state = OpenState::Waiting;

        // Normalize: the retry count includes the initial attempt.
        let attempts = options.retry_count.map(|count| count + 1).unwrap_or(1);
        self.connect_options.retry_count = Some(attempts);
        if attempts > 1 && self.connect_options.retry_interval.is_none() {
            self.connect_options.retry_interval = Some(Duration::from_secs(0));
        }
        self.connect_start_time = Some(Instant::now());

        if let Some(deadline) = options.deadline {
            let timer = make_timer(socket, true, |socket, event| {
                socket.process_connect_deadline_timer(event);
            });
            let _ = timer.schedule(deadline, None);
            self.connect_deadline_timer = Some(timer);
        }

        let retry_timer = make_timer(socket, attempts == 1, |socket, event| {
            socket.process_connect_retry_timer(event);
        });
        if attempts == 1 {
            let _ = retry_timer.schedule(Instant::now(), None);
        } else {
            let _ = retry_timer.schedule(Instant::now(), self.connect_options.retry_interval);
        }
        self.connect_retry_timer = Some(retry_timer);
        Ok(())
    }

    fn private_retry_connect(&mut self, socket: &Arc<StreamSocket>, announcer: &mut Announcer) {
        if self.open_state != OpenState::Waiting {
            return;
        }
        if !self.connect_in_progress {
            return;
        }
        let remaining = match self.connect_options.retry_count {
            Some(remaining) if remaining > 0 => remaining,
            _ => return,
        };
        self.source_endpoint = None;
        self.remote_endpoint = None;
        self.flow_control.reset();
        self.shutdown_state.reset();
        self.connect_context = ConnectContext::default();
        self.open_state = OpenState::Connecting;
        self.connect_attempts += 1;
        self.connect_options.retry_count = Some(remaining - 1);

        let result = if self.connect_endpoint.is_some() {
            self.private_retry_connect_to_endpoint(socket)
        } else {
            self.private_retry_connect_to_name(socket)
        };
        if let Err(error) = result {
            self.private_fail_connect(socket, error, false, false, announcer);
        }
    }

    fn private_retry_connect_to_endpoint(
        &mut self,
        socket: &Arc<StreamSocket>,
    ) -> Result<(), Error> {
        let endpoint = self.connect_endpoint.clone().ok_or(Error::Invalid)?;
        self.connect_to_resolved(socket, &endpoint)
    }

    fn connect_to_resolved(
        &mut self,
        socket: &Arc<StreamSocket>,
        endpoint: &Endpoint,
    ) -> Result<(), Error> {
        if self.handle.is_none() {
            let mut scratch = Announcer::new();
            self.private_open(socket, endpoint.transport(), None, &mut scratch)?;
            debug_assert!(scratch.items.is_empty());
        }
        if self.transport == Transport::LocalStream && self.source_endpoint.is_none() {
            let reuse = self.options.reuse_address;
            if let Some(system) = self.system.as_mut() {
                system.bind_any(Transport::LocalStream, reuse)?;
                self.source_endpoint = system.source_endpoint().ok();
            }
        }
        let proactor = socket.proactor.get().ok_or(Error::Invalid)?;
        proactor.connect(socket, endpoint)?;
        if let Some(system) = self.system.as_ref() {
            if let Ok(source) = system.source_endpoint() {
                self.source_endpoint = Some(source);
            }
        }
        Ok(())
    }

    fn private_retry_connect_to_name(&mut self, socket: &Arc<StreamSocket>) -> Result<(), Error> {
        let resolver = socket.resolver.get().ok_or(Error::Invalid)?;
        let name = self.connect_name.clone().ok_or(Error::Invalid)?;
        let attempts = self.connect_attempts;
        let weak = socket.weak_self.clone();
        let options = GetEndpointOptions {
            transport: Some(self.options.transport),
        };
        resolver.get_endpoint(
            &name,
            &options,
            Box::new(move |endpoint, event| {
                if let Some(socket) = weak.upgrade() {
                    socket.process_remote_endpoint_resolution(endpoint, event, attempts);
                }
            }),
        )
    }

    fn private_complete_connect(&mut self, socket: &Arc<StreamSocket>, announcer: &mut Announcer) {
        if !self.connect_in_progress {
            return;
        }
        let last_error = self
            .system
            .as_ref()
            .and_then(|system| system.last_error());
        let remote = match self
            .system
            .as_ref()
            .map(|system| system.remote_endpoint())
        {
            Some(Ok(remote)) => remote,
            Some(Err(error)) => {
                self.private_fail_connect(
                    socket,
                    last_error.unwrap_or(error),
                    false,
                    false,
                    announcer,
                );
                return;
            }
            None => {
                self.private_fail_connect(
                    socket,
                    last_error.unwrap_or(Error::Invalid),
                    false,
                    false,
                    announcer,
                );
                return;
            }
        };
        self.remote_endpoint = Some(remote);
        if let Some(system) = self.system.as_ref() {
            if let Ok(source) = system.source_endpoint() {
                self.source_endpoint = Some(source);
            }
            if let Ok(size) = system.send_buffer_size() {
                if size > 0 {
                    self.send_max_bytes = size * 2;
                }
            }
            if let Ok(size) = system.receive_buffer_size() {
                if size > 0 {
                    self.receive_max_bytes = size;
                }
            }
        }

        self.connect_context.error = None;
        self.connect_context.attempts_remaining = 0;
        self.connect_context.latency = self
            .connect_start_time
            .map(|start| start.elapsed());
        if self.connect_context.name.is_none() {
            self.connect_context.name = self.connect_name.clone();
        }
        if self.connect_context.endpoint.is_none() {
            self.connect_context.endpoint = self
                .connect_endpoint
                .clone()
                .or_else(|| self.remote_endpoint.clone());
        }
        self.connect_options.retry_count = Some(0);
        self.connect_in_progress = false;
        self.open_state = OpenState::Connected;

        let callback = self.connect_callback.take();
        let context = mem::take(&mut self.connect_context);
        if let Some(timer) = self.connect_deadline_timer.take() {
            timer.close();
        }
        if let Some(timer) = self.connect_retry_timer.take() {
            timer.close();
        }
        debug!(socket.log, "connection attempt succeeded";
            "remote" => self.remote_endpoint.as_ref().map(|e| e.to_string()).unwrap_or_default());
        if let Some(callback) = callback {
            let socket = socket.clone();
            announcer.push(false, move || {
                callback(&socket, ConnectEvent::Complete(context));
            });
        }
        self.announce_established(socket, announcer, false);
    }

    /// Handle a failed connect attempt. Failures with retries remaining
    /// tear down the socket and schedule the next attempt without
    /// surfacing events; the terminal failure announces the one-shot
    /// connect callback.
    fn private_fail_connect(
        &mut self,
        socket: &Arc<StreamSocket>,
        error: Error,
        defer: bool,
        close: bool,
        announcer: &mut Announcer,
    ) {
        if !self.connect_in_progress {
            return;
        }
        debug_assert_ne!(self.detach_state, DetachState::DetachInitiated);
        if close {
            self.connect_options.retry_count = Some(0);
        }
        if self.connect_context.error.is_none() || close {
            debug!(socket.log, "connection attempt failed"; "error" => %error);
            self.connect_context.error = Some(error);
            let remaining = self.connect_options.retry_count.unwrap_or(0);
            self.connect_context.attempts_remaining = remaining;
            if self.connect_context.name.is_none() {
                self.connect_context.name = self.connect_name.clone();
            }
            if self.connect_context.endpoint.is_none() {
                self.connect_context.endpoint = self.connect_endpoint.clone();
            }

            let terminal = remaining == 0;
            let mut callback = None;
            let mut event = None;
            if terminal {
                self.open_state = OpenState::Closed;
                self.connect_in_progress = false;
                callback = self.connect_callback.take();
                event = Some(ConnectEvent::Error(mem::take(&mut self.connect_context)));
                if let Some(timer) = self.connect_deadline_timer.take() {
                    timer.close();
                }
                if let Some(timer) = self.connect_retry_timer.take() {
                    timer.close();
                }
                self.flow_control.close();
                self.shutdown_state.close();
            } else {
                self.open_state = OpenState::Waiting;
            }

            let mut detach_started = false;
            if self.handle.is_some() {
                if let Some(proactor) = socket.proactor.get() {
                    proactor.cancel(socket);
                    if proactor.detach_socket(socket).is_ok() {
                        self.detach_state = DetachState::DetachInitiated;
                        detach_started = true;
                    }
                }
            }

            if terminal {
                if let (Some(pool), Some(proactor)) =
                    (socket.proactor_pool.get(), socket.proactor.get())
                {
                    pool.release_proactor(&proactor, &self.options.load_balancing);
                }
            }

            if detach_started {
                debug_assert!(self.deferred_call.is_none());
                self.deferred_call = Some(DeferredCall::FailConnectPart2 {
                    callback,
                    event,
                    defer,
                });
            } else {
                self.private_fail_connect_part2(socket, callback, event, defer, announcer);
            }
        } else if self.retry_connect {
            self.retry_connect = false;
            self.private_retry_connect(socket, announcer);
        }
    }

    fn private_fail_connect_part2(
        &mut self,
        socket: &Arc<StreamSocket>,
        callback: Option<ConnectCallback>,
        event: Option<ConnectEvent>,
        defer: bool,
        announcer: &mut Announcer,
    ) {
        if self.handle.is_some() {
            if let Some(mut system) = self.system.take() {
                if let Some(proactor) = socket.proactor.get() {
                    proactor.release_handle_reservation();
                }
                system.close();
            }
            trace!(socket.log, "stream socket closed";
                "descriptor" => self.handle.unwrap_or(0));
            self.handle = None;
        }

        if let (Some(callback), Some(event)) = (callback, event) {
            let socket_ref = socket.clone();
            announcer.push(defer, move || callback(&socket_ref, event));
        }

        if self.connect_options.retry_count.unwrap_or(0) == 0 && !self.connect_in_progress {
            socket.resolver.reset();
            self.listener = None;
            self.manager = None;
        }

        if let Some(callback) = self.close_callback.take() {
            let socket_ref = socket.clone();
            announcer.push(true, move || callback(&socket_ref));
        }

        if self.retry_connect {
            self.retry_connect = false;
            self.private_retry_connect(socket, announcer);
        }

        for functor in self.deferred_calls.drain(..).collect::<Vec<_>>() {
            announcer.push_functor(true, functor);
        }
    }

    // ---------------------------------------------------------------
    // Upgrade
    // ---------------------------------------------------------------

    fn private_upgrade(
        &mut self,
        socket: &Arc<StreamSocket>,
        options: &UpgradeOptions,
        announcer: &mut Announcer,
    ) -> Result<(), Error> {
        let encryption = self.encryption.clone().ok_or(Error::Invalid)?;
        debug!(socket.log, "upgrade to encrypted communication starting");
        encryption.initiate_handshake(options, None)?;

        // Unconsumed receive-queue data must now be considered cipher
        // text: decrypt it and re-form the queue from the plaintext,
        // keeping the earliest arrival timestamp.
        if self.receive_queue.size() > 0 {
            let earliest = self
                .receive_queue
                .front_entry()
                .map(|entry| entry.timestamp)
                .unwrap_or_else(Instant::now);
            let buffered = self.receive_queue.take_data();
            encryption.push_incoming_cipher_text(&buffered)?;
            let mut plaintext = BytesMut::new();
            while encryption.has_incoming_plain_text() {
                encryption.pop_incoming_plain_text(&mut plaintext)?;
            }
            if !plaintext.is_empty() {
                self.receive_queue.append(&plaintext);
            }
            self.receive_queue.reform(earliest);
        }

        self.private_poll_upgrade(socket, announcer);
        self.flush_encryption_output(socket, announcer)?;
        Ok(())
    }

    /// Claim the session's one-shot handshake outcome, completing or
    /// failing the upgrade.
    fn private_poll_upgrade(&mut self, socket: &Arc<StreamSocket>, announcer: &mut Announcer) {
        if !self.upgrade_in_progress {
            return;
        }
        let encryption = match self.encryption.clone() {
            Some(encryption) => encryption,
            None => return,
        };
        if let Some(outcome) = encryption.take_handshake_outcome() {
            match outcome.error {
                None => {
                    debug!(socket.log, "upgrade to encrypted communication complete");
                    self.upgrade_in_progress = false;
                    if let Some(timer) = self.upgrade_timer.take() {
                        timer.close();
                    }
                    if let Some(callback) = self.upgrade_callback.take() {
                        let socket = socket.clone();
                        announcer.push(false, move || {
                            callback(&socket, UpgradeEvent::Complete(UpgradeContext::default()));
                        });
                    }
                }
                Some(error) => {
                    self.private_fail_upgrade(socket, error, outcome.details, announcer);
                }
            }
        }
    }

    fn private_fail_upgrade(
        &mut self,
        socket: &Arc<StreamSocket>,
        error: Error,
        description: String,
        announcer: &mut Announcer,
    ) {
        if !self.upgrade_in_progress {
            return;
        }
        debug!(socket.log, "upgrade to encrypted communication failed";
            "error" => %error, "description" => &description);
        self.encryption = None;
        self.upgrade_in_progress = false;
        let callback = self.upgrade_callback.take();
        if let Some(timer) = self.upgrade_timer.take() {
            timer.close();
        }
        let _ = self.private_apply_flow_control(
            socket,
            FlowControlType::Both,
            FlowControlMode::Immediate,
            false,
            true,
            announcer,
        );
        self.flow_control.close();
        if let Some(callback) = callback {
            let socket_ref = socket.clone();
            let context = UpgradeContext {
                error: Some(error),
                error_description: description,
            };
            announcer.push(false, move || {
                callback(&socket_ref, UpgradeEvent::Error(context));
            });
        }
        let _ = self.private_shutdown(
            socket,
            ShutdownType::Both,
            ShutdownMode::Immediate,
            announcer,
        );
    }

    /// Send any ciphertext the session has pending through the normal
    /// send path.
    fn flush_encryption_output(
        &mut self,
        socket: &Arc<StreamSocket>,
        announcer: &mut Announcer,
    ) -> Result<(), Error> {
        let encryption = match self.encryption.clone() {
            Some(encryption) => encryption,
            None => return Ok(()),
        };
        if encryption.has_outgoing_cipher_text() {
            let mut cipher = BytesMut::new();
            while encryption.has_outgoing_cipher_text() {
                encryption.pop_outgoing_cipher_text(&mut cipher)?;
            }
            if !cipher.is_empty() {
                self.private_send_raw(
                    socket,
                    cipher.freeze(),
                    &SendOptions::default(),
                    None,
                    announcer,
                )?;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Send path
    // ---------------------------------------------------------------

    fn private_send_raw(
        &mut self,
        socket: &Arc<StreamSocket>,
        data: Bytes,
        options: &SendOptions,
        callback: Option<SendCallback>,
        announcer: &mut Announcer,
    ) -> Result<(), Error> {
        let id = self.send_queue.generate_entry_id();
        let mut entry = SendQueueEntry {
            id,
            token: options.token,
            length: data.len(),
            data: Some(data),
            timestamp: Instant::now(),
            deadline: None,
            timer: None,
            callback,
        };
        if let Some(deadline) = options.deadline {
            let timer = make_timer(socket, true, move |socket, event| {
                socket.process_send_deadline_timer(event, id);
            });
            let _ = timer.schedule(deadline, None);
            entry.deadline = Some(deadline);
            entry.timer = Some(timer);
        }
        let became_non_empty = self.send_queue.push(entry);
        trace!(socket.log, "write queue filled"; "size" => self.send_queue.size());
        if became_non_empty {
            self.private_relax_flow_control(socket, FlowControlType::Send, true, false, announcer);
        }
        Ok(())
    }

    fn private_initiate_send(&mut self, socket: &Arc<StreamSocket>, announcer: &mut Announcer) {
        if self.send_pending {
            return;
        }
        if !self.flow_control.want_send() {
            return;
        }
        if !self.shutdown_state.can_send() {
            return;
        }
        if self.send_rate_limiter.is_some()
            && self.private_throttle_send_buffer(socket, announcer).is_err()
        {
            return;
        }
        while self.send_queue.has_entry() {
            let has_data = self
                .send_queue
                .front()
                .map(|entry| entry.data.is_some())
                .unwrap_or(false);
            if has_data {
                let proactor = match socket.proactor.get() {
                    Some(proactor) => proactor,
                    None => {
                        self.private_fail_send(socket, Error::Invalid, announcer);
                        break;
                    }
                };

                #[cfg(target_os = "linux")]
                {
                    self.send_count += 1;
                    if self.send_count >= SEND_BUFFER_REFRESH_INTERVAL {
                        let head_length =
                            self.send_queue.front().map(|entry| entry.length).unwrap_or(0);
                        if head_length >= SEND_BUFFER_REFRESH_SIZE_THRESHOLD {
                            if let Some(system) = self.system.as_ref() {
                                if let Ok(size) = system.send_buffer_size() {
                                    if size > 0 {
                                        self.send_max_bytes = size * 2;
                                    }
                                }
                            }
                        }
                        self.send_count = 0;
                    }
                }

                let data = match self.send_queue.front().and_then(|entry| entry.data.clone()) {
                    Some(data) => data,
                    None => break,
                };
                match proactor.send(socket, data, self.send_max_bytes) {
                    Err(error) => {
                        self.private_fail_send(socket, error, announcer);
                        continue;
                    }
                    Ok(()) => {
                        // The deadline no longer applies once the entry
                        // has begun draining into the kernel.
                        if let Some(front) = self.send_queue.front_mut() {
                            front.close_timer();
                        }
                        self.send_pending = true;
                        break;
                    }
                }
            } else {
                self.send_queue.pop_front();
                self.private_shutdown_send(socket, announcer);
            }
        }
    }

    fn private_complete_send(
        &mut self,
        socket: &Arc<StreamSocket>,
        sent: usize,
        announcer: &mut Announcer,
    ) {
        if let Some(limiter) = self.send_rate_limiter.as_ref() {
            limiter.submit(sent);
        }
        if !self.send_queue.has_entry() {
            return;
        }
        let head_length = self.send_queue.front().map(|entry| entry.length).unwrap_or(0);
        let mut callback = None;
        if sent == head_length {
            if let Some(mut entry) = self.send_queue.pop_front() {
                entry.close_timer();
                callback = entry.callback.take();
            }
        } else {
            self.send_queue.pop_size(sent);
        }
        trace!(socket.log, "write queue drained"; "size" => self.send_queue.size());
        if let Some(callback) = callback {
            let socket_ref = socket.clone();
            announcer.push(false, move || {
                callback(&socket_ref, SendEvent::Complete(SendContext::default()));
            });
        }
        if self.send_queue.authorize_low_watermark_event() {
            let context = self.send_queue.context();
            self.announce_write_event(
                socket,
                announcer,
                true,
                WriteQueueEvent::LowWatermark(context),
            );
        }
        if !self.send_queue.has_entry() {
            let _ = self.private_apply_flow_control(
                socket,
                FlowControlType::Send,
                FlowControlMode::Immediate,
                false,
                false,
                announcer,
            );
        }
    }

    fn private_fail_send(
        &mut self,
        socket: &Arc<StreamSocket>,
        error: Error,
        announcer: &mut Announcer,
    ) {
        if !self.send_queue.has_entry() {
            return;
        }
        if let Some(mut entry) = self.send_queue.pop_front() {
            entry.close_timer();
            if let Some(callback) = entry.callback.take() {
                let socket = socket.clone();
                announcer.push(false, move || {
                    callback(&socket, SendEvent::Error(SendContext { error: Some(error) }));
                });
            }
        }
    }

    fn private_throttle_send_buffer(
        &mut self,
        socket: &Arc<StreamSocket>,
        announcer: &mut Announcer,
    ) -> Result<(), Error> {
        let limiter = match self.send_rate_limiter.clone() {
            Some(limiter) => limiter,
            None => return Ok(()),
        };
        let now = Instant::now();
        if !limiter.would_exceed_bandwidth(now) {
            return Ok(());
        }
        let delay = limiter.calculate_time_to_submit(now);
        debug!(socket.log, "write rate limit applied"; "delay_ms" => delay.as_millis() as u64);
        let _ = self.private_apply_flow_control(
            socket,
            FlowControlType::Send,
            FlowControlMode::Immediate,
            false,
            true,
            announcer,
        );
        if !self.shutdown_state.can_send() {
            return Err(Error::Invalid);
        }
        if self.send_rate_timer.is_none() {
            let timer = make_timer(socket, true, |socket, event| {
                socket.process_send_rate_timer(event);
            });
            self.send_rate_timer = Some(timer);
        }
        if let Some(timer) = self.send_rate_timer.as_ref() {
            let _ = timer.schedule(now + delay, None);
        }
        let context = self.send_queue.context();
        self.announce_write_event(
            socket,
            announcer,
            true,
            WriteQueueEvent::RateLimitApplied(context),
        );
        Err(Error::WouldBlock)
    }

    // ---------------------------------------------------------------
    // Receive path
    // ---------------------------------------------------------------

    fn private_initiate_receive(&mut self, socket: &Arc<StreamSocket>, announcer: &mut Announcer) {
        if self.receive_pending {
            return;
        }
        if !self.flow_control.want_receive() {
            return;
        }
        if !self.shutdown_state.can_receive() {
            return;
        }
        let proactor = match socket.proactor.get() {
            Some(proactor) => proactor,
            None => {
                self.private_fail(socket, Error::Invalid, announcer);
                return;
            }
        };
        if self.receive_rate_limiter.is_some()
            && self
                .private_throttle_receive_buffer(socket, announcer)
                .is_err()
        {
            return;
        }
        let max_transfer = self
            .receive_max_bytes
            .min(self.options.max_incoming_stream_transfer_size)
            .max(1);
        let size = self.receive_feedback.receive_size(
            self.receive_queue.low_watermark(),
            self.options.min_incoming_stream_transfer_size,
            max_transfer,
        );
        if let Err(error) = proactor.receive(socket, size) {
            self.private_fail(socket, error, announcer);
            return;
        }
        self.receive_pending = true;
    }

    fn private_complete_receive(
        &mut self,
        socket: &Arc<StreamSocket>,
        attempted: usize,
        data: Bytes,
        announcer: &mut Announcer,
    ) {
        if data.is_empty() {
            // The peer shut down its write side.
            self.private_shutdown_receive(socket, ShutdownOrigin::Remote, announcer);
            return;
        }
        self.receive_feedback.set_feedback(attempted, data.len());
        if let Some(limiter) = self.receive_rate_limiter.as_ref() {
            limiter.submit(data.len());
        }

        let received;
        match self.encryption.clone() {
            None => {
                self.receive_queue.append(&data);
                received = data.len();
            }
            Some(encryption) => {
                let before = self.receive_queue.size();
                if let Err(error) = encryption.push_incoming_cipher_text(&data) {
                    if self.upgrade_in_progress {
                        let details = encryption
                            .take_handshake_outcome()
                            .map(|outcome| outcome.details)
                            .unwrap_or_default();
                        self.private_fail_upgrade(socket, error, details, announcer);
                    } else {
                        self.private_fail(socket, error, announcer);
                    }
                    return;
                }
                let mut plaintext = BytesMut::new();
                while encryption.has_incoming_plain_text() {
                    if encryption.pop_incoming_plain_text(&mut plaintext).is_err() {
                        self.private_fail(socket, Error::Invalid, announcer);
                        return;
                    }
                }
                if !plaintext.is_empty() {
                    self.receive_queue.append(&plaintext);
                }
                received = self.receive_queue.size() - before;
                self.private_poll_upgrade(socket, announcer);
            }
        }
        if received > 0 {
            self.receive_queue.push_entry(received, Instant::now());
        }
        trace!(socket.log, "read queue filled"; "size" => self.receive_queue.size());

        // Satisfy waiting readers in order, never splitting a
        // completion below its minimum size.
        while let Some(entry) = self.receive_queue.pop_callback_entry() {
            let options = entry.options();
            let block = self.receive_queue.dequeue(options.max_size);
            debug_assert!(block.len() >= options.min_size);
            trace!(socket.log, "read queue drained"; "size" => self.receive_queue.size());
            let event = ReceiveEvent::Complete(self.receive_context(None));
            dispatch_receive(&entry, socket, announcer, false, Some(block), event);
        }

        if self.receive_queue.authorize_low_watermark_event() {
            let context = self.receive_queue.context();
            self.announce_read_event(
                socket,
                announcer,
                false,
                ReadQueueEvent::LowWatermark(context),
            );
        }
        if self.receive_queue.authorize_high_watermark_event() {
            warn!(socket.log, "read queue high watermark breached";
                "size" => self.receive_queue.size(),
                "high_watermark" => self.receive_queue.high_watermark());
            let _ = self.private_apply_flow_control(
                socket,
                FlowControlType::Receive,
                FlowControlMode::Immediate,
                false,
                false,
                announcer,
            );
            let context = self.receive_queue.context();
            self.announce_read_event(
                socket,
                announcer,
                false,
                ReadQueueEvent::HighWatermark(context),
            );
        }

        if let Some(encryption) = self.encryption.clone() {
            if encryption.is_shutdown_received() && !encryption.is_shutdown_sent() {
                // Echo the peer's close-notify.
                if let Err(error) = encryption.shutdown() {
                    self.private_fail(socket, error, announcer);
                    return;
                }
                self.announce_downgrade(socket, announcer, false, DowngradeEvent::Initiated);
            }
            if let Err(error) = self.flush_encryption_output(socket, announcer) {
                self.private_fail(socket, error, announcer);
                return;
            }
            if encryption.is_shutdown_finished() {
                self.encryption = None;
                self.announce_downgrade(socket, announcer, false, DowngradeEvent::Complete);
            }
        }
    }

    fn private_throttle_receive_buffer(
        &mut self,
        socket: &Arc<StreamSocket>,
        announcer: &mut Announcer,
    ) -> Result<(), Error> {
        let limiter = match self.receive_rate_limiter.clone() {
            Some(limiter) => limiter,
            None => return Ok(()),
        };
        let now = Instant::now();
        if !limiter.would_exceed_bandwidth(now) {
            return Ok(());
        }
        let delay = limiter.calculate_time_to_submit(now);
        debug!(socket.log, "read rate limit applied"; "delay_ms" => delay.as_millis() as u64);
        let _ = self.private_apply_flow_control(
            socket,
            FlowControlType::Receive,
            FlowControlMode::Immediate,
            false,
            true,
            announcer,
        );
        if !self.shutdown_state.can_receive() {
            return Err(Error::Invalid);
        }
        if self.receive_rate_timer.is_none() {
            let timer = make_timer(socket, true, |socket, event| {
                socket.process_receive_rate_timer(event);
            });
            self.receive_rate_timer = Some(timer);
        }
        if let Some(timer) = self.receive_rate_timer.as_ref() {
            let _ = timer.schedule(now + delay, None);
        }
        let context = self.receive_queue.context();
        self.announce_read_event(
            socket,
            announcer,
            true,
            ReadQueueEvent::RateLimitApplied(context),
        );
        Err(Error::WouldBlock)
    }

    // ---------------------------------------------------------------
    // Failure
    // ---------------------------------------------------------------

    fn private_fail(&mut self, socket: &Arc<StreamSocket>, error: Error, announcer: &mut Announcer) {
        if self.connect_in_progress {
            self.private_fail_connect(socket, error, false, false, announcer);
            return;
        }
        if self.upgrade_in_progress {
            self.private_fail_upgrade(socket, error, String::new(), announcer);
            return;
        }
        let _ = self.private_apply_flow_control(
            socket,
            FlowControlType::Both,
            FlowControlMode::Immediate,
            false,
            true,
            announcer,
        );
        self.flow_control.close();

        // A dead or reset connection detected right after the peer's
        // close-notify raced a TCP shutdown is not a transport error:
        // treat it as an asynchronous observation that the connection
        // has completely shut down.
        if error == Error::ConnectionDead || error == Error::ConnectionReset {
            self.private_shutdown_receive(socket, ShutdownOrigin::Remote, announcer);
            self.private_shutdown_send(socket, announcer);
        } else {
            self.announce_error(
                socket,
                announcer,
                false,
                ErrorEvent::Transport(ErrorContext { error }),
            );
            let _ = self.private_shutdown(
                socket,
                ShutdownType::Both,
                ShutdownMode::Immediate,
                announcer,
            );
        }
    }

    // ---------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------

    fn private_shutdown(
        &mut self,
        socket: &Arc<StreamSocket>,
        direction: ShutdownType,
        mode: ShutdownMode,
        announcer: &mut Announcer,
    ) -> Result<(), Error> {
        let shutdown_receive =
            direction == ShutdownType::Receive || direction == ShutdownType::Both;
        let shutdown_send = direction == ShutdownType::Send || direction == ShutdownType::Both;

        let close_announcement_required =
            self.close_callback.is_some() && self.shutdown_state.completed();

        if shutdown_receive && self.shutdown_state.can_receive() {
            self.private_shutdown_receive(socket, ShutdownOrigin::Source, announcer);
        }

        if shutdown_send && self.shutdown_state.can_send() {
            if mode == ShutdownMode::Graceful && self.send_queue.has_entry() {
                let id = self.send_queue.generate_entry_id();
                self.send_queue.push(SendQueueEntry::marker(id));
                self.private_relax_flow_control(
                    socket,
                    FlowControlType::Send,
                    true,
                    true,
                    announcer,
                );
            } else {
                self.private_shutdown_send(socket, announcer);
            }
        }

        if close_announcement_required {
            if let Some(callback) = self.close_callback.take() {
                let socket = socket.clone();
                announcer.push(true, move || callback(&socket));
            }
        }
        Ok(())
    }

    fn private_shutdown_send(&mut self, socket: &Arc<StreamSocket>, announcer: &mut Announcer) {
        let keep_half_open = self.keep_half_open();
        let mut context = ShutdownContext {
            origin: ShutdownOrigin::Source,
            initiated: false,
            send: false,
            receive: false,
            completed: false,
        };
        if self
            .shutdown_state
            .try_shutdown_send(&mut context, keep_half_open)
        {
            self.private_shutdown_sequence(socket, &context, announcer);
        }
    }

    fn private_shutdown_receive(
        &mut self,
        socket: &Arc<StreamSocket>,
        origin: ShutdownOrigin,
        announcer: &mut Announcer,
    ) {
        let keep_half_open = self.keep_half_open();
        let mut context = ShutdownContext {
            origin,
            initiated: false,
            send: false,
            receive: false,
            completed: false,
        };
        if self
            .shutdown_state
            .try_shutdown_receive(&mut context, keep_half_open, origin)
        {
            self.private_shutdown_sequence(socket, &context, announcer);
        }
    }

    /// Drive the shutdown announcements. Announcements from this
    /// sequence are always deferred so the user cannot observe them
    /// out of order when the shutdown is initiated by the calling
    /// thread but completed by a proactor thread.
    fn private_shutdown_sequence(
        &mut self,
        socket: &Arc<StreamSocket>,
        context: &ShutdownContext,
        announcer: &mut Announcer,
    ) {
        let async_detach_started = if context.completed {
            self.private_close_flow_control(socket, announcer)
        } else {
            if context.send {
                let _ = self.private_apply_flow_control(
                    socket,
                    FlowControlType::Send,
                    FlowControlMode::Immediate,
                    true,
                    true,
                    announcer,
                );
            }
            if context.receive {
                let _ = self.private_apply_flow_control(
                    socket,
                    FlowControlType::Receive,
                    FlowControlMode::Immediate,
                    true,
                    true,
                    announcer,
                );
            }
            false
        };

        if async_detach_started {
            debug_assert!(self.deferred_call.is_none());
            self.deferred_call = Some(DeferredCall::ShutdownSequencePart2 { context: *context });
        } else {
            self.private_shutdown_sequence_part2(socket, context, announcer);
        }
    }

    fn private_shutdown_sequence_part2(
        &mut self,
        socket: &Arc<StreamSocket>,
        context: &ShutdownContext,
        announcer: &mut Announcer,
    ) {
        if context.send && !self.options.abortive_close {
            if let Some(system) = self.system.as_mut() {
                let _ = system.shutdown(ShutdownType::Send);
            }
        }
        if context.receive && !self.options.abortive_close {
            if let Some(system) = self.system.as_mut() {
                let _ = system.shutdown(ShutdownType::Receive);
            }
        }

        if context.initiated {
            self.announce_shutdown(
                socket,
                announcer,
                true,
                ShutdownEvent::Initiated(context.origin),
            );
        }

        if context.send {
            trace!(socket.log, "shutting down the send direction");
            if let Some(timer) = self.send_rate_timer.take() {
                timer.close();
            }
            let (entries, discarded) = self.send_queue.remove_all();

            if self.upgrade_in_progress {
                let error = if context.origin == ShutdownOrigin::Source {
                    Error::Cancelled
                } else {
                    Error::ConnectionDead
                };
                self.upgrade_in_progress = false;
                self.encryption = None;
                let callback = self.upgrade_callback.take();
                if let Some(timer) = self.upgrade_timer.take() {
                    timer.close();
                }
                if let Some(callback) = callback {
                    let socket_ref = socket.clone();
                    announcer.push(true, move || {
                        callback(
                            &socket_ref,
                            UpgradeEvent::Error(UpgradeContext {
                                error: Some(error),
                                error_description: String::new(),
                            }),
                        );
                    });
                }
            }

            for mut entry in entries {
                entry.close_timer();
                if let Some(callback) = entry.callback.take() {
                    let socket_ref = socket.clone();
                    announcer.push(true, move || {
                        callback(
                            &socket_ref,
                            SendEvent::Error(SendContext {
                                error: Some(Error::Cancelled),
                            }),
                        );
                    });
                }
            }

            if discarded {
                let queue_context = self.send_queue.context();
                self.announce_write_event(
                    socket,
                    announcer,
                    true,
                    WriteQueueEvent::Discarded(queue_context),
                );
            }

            self.announce_shutdown(socket, announcer, true, ShutdownEvent::Send(context.origin));
        }

        if context.receive {
            trace!(socket.log, "shutting down the receive direction");
            if let Some(timer) = self.receive_rate_timer.take() {
                timer.close();
            }
            for entry in self.receive_queue.pop_all_callback_entries() {
                let event = ReceiveEvent::Error(self.receive_context(Some(Error::Eof)));
                dispatch_receive(&entry, socket, announcer, true, None, event);
            }

            // Force a read-queue low-watermark announcement to give the
            // user the opportunity to receive EOF.
            let queue_context = self.receive_queue.context();
            self.announce_read_event(
                socket,
                announcer,
                true,
                ReadQueueEvent::LowWatermark(queue_context),
            );
            self.announce_shutdown(
                socket,
                announcer,
                true,
                ShutdownEvent::Receive(context.origin),
            );
        }

        if context.completed {
            self.announce_shutdown(
                socket,
                announcer,
                true,
                ShutdownEvent::Complete(context.origin),
            );

            if let (Some(pool), Some(proactor)) =
                (socket.proactor_pool.get(), socket.proactor.get())
            {
                pool.release_proactor(&proactor, &self.options.load_balancing);
            }

            if let Some(mut system) = self.system.take() {
                if let Some(proactor) = socket.proactor.get() {
                    proactor.release_handle_reservation();
                }
                system.close();
            }
            trace!(socket.log, "stream socket closed";
                "descriptor" => self.handle.unwrap_or(0));
            self.handle = None;
            self.open_state = OpenState::Closed;

            self.announce_closed(socket, announcer, true);
            if let Some(callback) = self.close_callback.take() {
                let socket_ref = socket.clone();
                announcer.push(true, move || callback(&socket_ref));
            }
            socket.resolver.reset();
            self.listener = None;
            self.manager = None;
        }

        for functor in self.deferred_calls.drain(..).collect::<Vec<_>>() {
            announcer.push_functor(true, functor);
        }
    }

    // ---------------------------------------------------------------
    // Flow control
    // ---------------------------------------------------------------

    fn private_relax_flow_control(
        &mut self,
        socket: &Arc<StreamSocket>,
        direction: FlowControlType,
        defer: bool,
        unlock: bool,
        announcer: &mut Announcer,
    ) {
        let (relax_send, relax_receive) = directions(direction);
        let mut context = FlowControlContext::default();
        if self
            .flow_control
            .relax(&mut context, relax_send, relax_receive, unlock)
        {
            if relax_send && context.enable_send && self.shutdown_state.can_send() {
                let queue_context = self.send_queue.context();
                self.announce_write_event(
                    socket,
                    announcer,
                    defer,
                    WriteQueueEvent::FlowControlRelaxed(queue_context),
                );
                self.private_initiate_send(socket, announcer);
            }
            if relax_receive && context.enable_receive && self.shutdown_state.can_receive() {
                let queue_context = self.receive_queue.context();
                self.announce_read_event(
                    socket,
                    announcer,
                    defer,
                    ReadQueueEvent::FlowControlRelaxed(queue_context),
                );
                self.private_initiate_receive(socket, announcer);
            }
        }
    }

    fn private_apply_flow_control(
        &mut self,
        socket: &Arc<StreamSocket>,
        direction: FlowControlType,
        mode: FlowControlMode,
        defer: bool,
        lock: bool,
        announcer: &mut Announcer,
    ) -> Result<(), Error> {
        let _ = mode;
        let (apply_send, apply_receive) = directions(direction);
        let mut context = FlowControlContext::default();
        if self
            .flow_control
            .apply(&mut context, apply_send, apply_receive, lock)
        {
            if apply_send && !context.enable_send {
                let queue_context = self.send_queue.context();
                self.announce_write_event(
                    socket,
                    announcer,
                    defer,
                    WriteQueueEvent::FlowControlApplied(queue_context),
                );
                // The in-flight transfer, if any, finishes on its own.
            }
            if apply_receive && !context.enable_receive {
                let queue_context = self.receive_queue.context();
                self.announce_read_event(
                    socket,
                    announcer,
                    defer,
                    ReadQueueEvent::FlowControlApplied(queue_context),
                );
            }
        }
        Ok(())
    }

    /// Apply flow control in both directions with the terminal lock and
    /// begin detaching from the proactor. Returns whether an
    /// asynchronous detach was initiated.
    fn private_close_flow_control(
        &mut self,
        socket: &Arc<StreamSocket>,
        announcer: &mut Announcer,
    ) -> bool {
        let mut context = FlowControlContext::default();
        if self.flow_control.apply(&mut context, true, true, true) {
            if !context.enable_send {
                let queue_context = self.send_queue.context();
                self.announce_write_event(
                    socket,
                    announcer,
                    true,
                    WriteQueueEvent::FlowControlApplied(queue_context),
                );
            }
            if !context.enable_receive {
                let queue_context = self.receive_queue.context();
                self.announce_read_event(
                    socket,
                    announcer,
                    true,
                    ReadQueueEvent::FlowControlApplied(queue_context),
                );
            }
        }

        if self.handle.is_some() {
            if let Some(proactor) = socket.proactor.get() {
                debug_assert_ne!(self.detach_state, DetachState::DetachInitiated);
                proactor.cancel(socket);
                if proactor.detach_socket(socket).is_ok() {
                    self.detach_state = DetachState::DetachInitiated;
                    return true;
                }
            }
        }
        false
    }
}
