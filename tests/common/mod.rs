//! Deterministic test harness: a scripted proactor whose operations are
//! recorded and completed by the test, manually-fired timers, and a
//! recording listener/manager.
//!
//! The mock never calls back into a socket from inside a proactor
//! operation; completions are delivered explicitly by the test driver,
//! mirroring how a real completion engine reports from its own threads.

#![allow(dead_code)]

use bytes::Bytes;
use slog::{o, Drain, Logger};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use prosock::{
    DowngradeEvent, Endpoint, Error, Executor, Functor, Proactor, ReadQueueEvent, ShutdownEvent,
    ShutdownType, SocketListener, SocketManager, StreamSocket, SystemSocket, Timer, TimerCallback,
    TimerEvent, TimerEventType, TimerOptions, Transport, WriteQueueEvent,
};

pub fn test_logger() -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build();
    Logger::root(Mutex::new(drain).fuse(), o!())
}

pub fn endpoint(port: u16) -> Endpoint {
    Endpoint::Ip(SocketAddr::from(([127, 0, 0, 1], port)))
}

pub struct SysState {
    pub handle: u64,
    pub source: Option<Endpoint>,
    pub remote: Option<Endpoint>,
    pub shutdowns: Vec<ShutdownType>,
    pub closed: bool,
}

pub struct MockSystemSocket {
    pub state: Arc<Mutex<SysState>>,
}

impl SystemSocket for MockSystemSocket {
    fn handle(&self) -> u64 {
        self.state.lock().unwrap().handle
    }

    fn bind(&mut self, endpoint: &Endpoint, _reuse_address: bool) -> Result<(), Error> {
        self.state.lock().unwrap().source = Some(endpoint.clone());
        Ok(())
    }

    fn bind_any(&mut self, _transport: Transport, _reuse_address: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let path = format!("/tmp/prosock-test-{}", state.handle);
        state.source = Some(Endpoint::Local(path.into()));
        Ok(())
    }

    fn source_endpoint(&self) -> Result<Endpoint, Error> {
        self.state.lock().unwrap().source.clone().ok_or(Error::Invalid)
    }

    fn remote_endpoint(&self) -> Result<Endpoint, Error> {
        self.state.lock().unwrap().remote.clone().ok_or(Error::Invalid)
    }

    fn send_buffer_size(&self) -> Result<usize, Error> {
        Ok(64 * 1024)
    }

    fn receive_buffer_size(&self) -> Result<usize, Error> {
        Ok(64 * 1024)
    }

    fn shutdown(&mut self, direction: ShutdownType) -> Result<(), Error> {
        self.state.lock().unwrap().shutdowns.push(direction);
        Ok(())
    }

    fn last_error(&self) -> Option<Error> {
        None
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

#[derive(Debug, Clone)]
pub enum Op {
    Connect { endpoint: Endpoint },
    Send { data: Bytes, max_bytes: usize },
    Receive { max_bytes: usize },
}

pub struct MockTimerState {
    pub deadline: Option<Instant>,
    pub period: Option<Duration>,
    pub closed: bool,
}

pub struct MockTimer {
    pub options: TimerOptions,
    pub callback: TimerCallback,
    pub state: Mutex<MockTimerState>,
}

impl MockTimer {
    pub fn is_armed(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.closed && state.deadline.is_some()
    }

    /// Deliver the deadline event, as the proactor would at expiry.
    pub fn fire(&self) {
        let deadline = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            let deadline = match state.deadline {
                Some(deadline) => deadline,
                None => return,
            };
            if self.options.one_shot {
                state.deadline = None;
            }
            deadline
        };
        (self.callback)(&TimerEvent {
            kind: TimerEventType::Deadline,
            deadline: Some(deadline),
        });
    }
}

impl Timer for MockTimer {
    fn schedule(&self, deadline: Instant, period: Option<Duration>) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Invalid);
        }
        state.deadline = Some(deadline);
        state.period = period;
        Ok(())
    }

    fn cancel(&self) -> Result<(), Error> {
        self.state.lock().unwrap().deadline = None;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.deadline = None;
    }
}

struct MockStrand {
    queue: Arc<Mutex<VecDeque<Functor>>>,
}

impl Executor for MockStrand {
    fn execute(&self, f: Functor) {
        self.queue.lock().unwrap().push_back(f);
    }
}

pub struct ProactorState {
    pub next_handle: u64,
    pub attached: usize,
    pub detach_requests: VecDeque<Weak<StreamSocket>>,
    pub ops: VecDeque<(Weak<StreamSocket>, Op)>,
    pub sys_sockets: Vec<Arc<Mutex<SysState>>>,
    pub reservations: usize,
    pub reservation_limit: usize,
    pub timers: Vec<Arc<MockTimer>>,
    pub cancelled: usize,
}

pub struct MockProactor {
    pub state: Mutex<ProactorState>,
    strand_queue: Arc<Mutex<VecDeque<Functor>>>,
}

impl MockProactor {
    pub fn new() -> Arc<MockProactor> {
        Arc::new(MockProactor {
            state: Mutex::new(ProactorState {
                next_handle: 3,
                attached: 0,
                detach_requests: VecDeque::new(),
                ops: VecDeque::new(),
                sys_sockets: Vec::new(),
                reservations: 0,
                reservation_limit: 128,
                timers: Vec::new(),
                cancelled: 0,
            }),
            strand_queue: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    pub fn with_reservation_limit(limit: usize) -> Arc<MockProactor> {
        let proactor = Self::new();
        proactor.state.lock().unwrap().reservation_limit = limit;
        proactor
    }

    /// Complete pending detaches and run everything queued on the
    /// strand until both are empty.
    pub fn pump(&self) {
        loop {
            let detach = self.state.lock().unwrap().detach_requests.pop_front();
            if let Some(weak) = detach {
                if let Some(socket) = weak.upgrade() {
                    socket.process_socket_detached();
                }
                continue;
            }
            let functor = self.strand_queue.lock().unwrap().pop_front();
            match functor {
                Some(functor) => functor(),
                None => break,
            }
        }
    }

    pub fn timer(&self, index: usize) -> Arc<MockTimer> {
        self.state.lock().unwrap().timers[index].clone()
    }

    pub fn timer_count(&self) -> usize {
        self.state.lock().unwrap().timers.len()
    }

    /// Pop the oldest recorded operation, if any.
    pub fn pop_op(&self) -> Option<(Weak<StreamSocket>, Op)> {
        self.state.lock().unwrap().ops.pop_front()
    }

    /// Pop the oldest recorded send operation, failing the test when
    /// the next operation is not a send.
    pub fn pop_send(&self) -> Option<Bytes> {
        let mut state = self.state.lock().unwrap();
        let position = state.ops.iter().position(|(_, op)| match op {
            Op::Send { .. } => true,
            _ => false,
        })?;
        match state.ops.remove(position) {
            Some((_, Op::Send { data, .. })) => Some(data),
            _ => None,
        }
    }

    /// Pop the oldest recorded receive operation.
    pub fn pop_receive(&self) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        let position = state.ops.iter().position(|(_, op)| match op {
            Op::Receive { .. } => true,
            _ => false,
        })?;
        match state.ops.remove(position) {
            Some((_, Op::Receive { max_bytes })) => Some(max_bytes),
            _ => None,
        }
    }

    pub fn connect_op_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|(_, op)| match op {
                Op::Connect { .. } => true,
                _ => false,
            })
            .count()
    }

    /// Complete the oldest pending connect operation. On success the
    /// system socket's endpoints are populated the way the kernel
    /// would.
    pub fn complete_connect(&self, socket: &Arc<StreamSocket>, result: Result<(), Error>) {
        let op = {
            let mut state = self.state.lock().unwrap();
            let position = state.ops.iter().position(|(_, op)| match op {
                Op::Connect { .. } => true,
                _ => false,
            });
            position.and_then(|index| state.ops.remove(index))
        };
        if result.is_ok() {
            if let Some((_, Op::Connect { endpoint: remote_endpoint })) = op {
                if let Some(handle) = socket.handle() {
                    let state = self.state.lock().unwrap();
                    for sys in &state.sys_sockets {
                        let mut sys = sys.lock().unwrap();
                        if sys.handle == handle {
                            sys.remote = Some(remote_endpoint.clone());
                            if sys.source.is_none() {
                                sys.source = Some(endpoint(40000 + handle as u16));
                            }
                        }
                    }
                }
            }
        }
        socket.process_socket_connected(result);
    }

    /// Complete the oldest pending receive operation with `data`.
    pub fn deliver(&self, socket: &Arc<StreamSocket>, data: &[u8]) {
        let max_bytes = self.pop_receive().expect("no pending receive operation");
        socket.process_socket_received(max_bytes, Ok(Bytes::copy_from_slice(data)));
    }

    /// Complete the oldest pending send operation in full, returning
    /// the bytes the kernel accepted.
    pub fn complete_send(&self, socket: &Arc<StreamSocket>) -> Option<Bytes> {
        let data = self.pop_send()?;
        socket.process_socket_sent(Ok(data.len()));
        Some(data)
    }
}

impl Proactor for MockProactor {
    fn attach_socket(&self, _socket: &Arc<StreamSocket>) -> Result<(), Error> {
        self.state.lock().unwrap().attached += 1;
        Ok(())
    }

    fn detach_socket(&self, socket: &Arc<StreamSocket>) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.attached = state.attached.saturating_sub(1);
        state.detach_requests.push_back(Arc::downgrade(socket));
        Ok(())
    }

    fn connect(&self, socket: &Arc<StreamSocket>, endpoint: &Endpoint) -> Result<(), Error> {
        self.state.lock().unwrap().ops.push_back((
            Arc::downgrade(socket),
            Op::Connect {
                endpoint: endpoint.clone(),
            },
        ));
        Ok(())
    }

    fn send(
        &self,
        socket: &Arc<StreamSocket>,
        data: Bytes,
        max_bytes: usize,
    ) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .ops
            .push_back((Arc::downgrade(socket), Op::Send { data, max_bytes }));
        Ok(())
    }

    fn receive(&self, socket: &Arc<StreamSocket>, max_bytes: usize) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .ops
            .push_back((Arc::downgrade(socket), Op::Receive { max_bytes }));
        Ok(())
    }

    fn cancel(&self, _socket: &Arc<StreamSocket>) {
        self.state.lock().unwrap().cancelled += 1;
    }

    fn acquire_handle_reservation(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.reservations < state.reservation_limit {
            state.reservations += 1;
            true
        } else {
            false
        }
    }

    fn release_handle_reservation(&self) {
        let mut state = self.state.lock().unwrap();
        state.reservations = state.reservations.saturating_sub(1);
    }

    fn create_stream_socket(&self, _transport: Transport) -> Result<Box<dyn SystemSocket>, Error> {
        let mut state = self.state.lock().unwrap();
        let handle = state.next_handle;
        state.next_handle += 1;
        let sys = Arc::new(Mutex::new(SysState {
            handle,
            source: None,
            remote: None,
            shutdowns: Vec::new(),
            closed: false,
        }));
        state.sys_sockets.push(sys.clone());
        Ok(Box::new(MockSystemSocket { state: sys }))
    }

    fn create_strand(&self) -> Arc<dyn Executor> {
        Arc::new(MockStrand {
            queue: self.strand_queue.clone(),
        })
    }

    fn create_timer(&self, options: TimerOptions, callback: TimerCallback) -> Arc<dyn Timer> {
        let timer = Arc::new(MockTimer {
            options,
            callback,
            state: Mutex::new(MockTimerState {
                deadline: None,
                period: None,
                closed: false,
            }),
        });
        self.state.lock().unwrap().timers.push(timer.clone());
        timer
    }

    fn execute(&self, f: Functor) {
        self.strand_queue.lock().unwrap().push_back(f);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Read(ReadQueueEvent),
    Write(WriteQueueEvent),
    Shutdown(ShutdownEvent),
    Downgrade(DowngradeEvent),
    Error(prosock::ErrorEvent),
    Established,
    Closed,
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn shutdown_events(&self) -> Vec<Recorded> {
        self.events()
            .into_iter()
            .filter(|event| match event {
                Recorded::Shutdown(_) | Recorded::Closed => true,
                _ => false,
            })
            .collect()
    }

    pub fn write_events(&self) -> Vec<WriteQueueEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Recorded::Write(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn downgrade_events(&self) -> Vec<DowngradeEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Recorded::Downgrade(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl SocketListener for RecordingListener {
    fn on_read_queue(&self, _socket: &Arc<StreamSocket>, event: ReadQueueEvent) {
        self.push(Recorded::Read(event));
    }

    fn on_write_queue(&self, _socket: &Arc<StreamSocket>, event: WriteQueueEvent) {
        self.push(Recorded::Write(event));
    }

    fn on_shutdown(&self, _socket: &Arc<StreamSocket>, event: ShutdownEvent) {
        self.push(Recorded::Shutdown(event));
    }

    fn on_downgrade(&self, _socket: &Arc<StreamSocket>, event: DowngradeEvent) {
        self.push(Recorded::Downgrade(event));
    }

    fn on_error(&self, _socket: &Arc<StreamSocket>, event: prosock::ErrorEvent) {
        self.push(Recorded::Error(event));
    }
}

impl SocketManager for RecordingListener {
    fn on_established(&self, _socket: &Arc<StreamSocket>) {
        self.push(Recorded::Established);
    }

    fn on_closed(&self, _socket: &Arc<StreamSocket>) {
        self.push(Recorded::Closed);
    }
}

/// Build a socket on `proactor`, connect it to `127.0.0.1:9000`, and
/// drive the connect to completion.
pub fn establish(
    proactor: &Arc<MockProactor>,
    options: prosock::StreamSocketOptions,
) -> (Arc<StreamSocket>, Arc<RecordingListener>) {
    let proactor_dyn: Arc<dyn Proactor> = proactor.clone();
    let socket = StreamSocket::new(test_logger(), options, &proactor_dyn, None, None);
    let listener = Arc::new(RecordingListener::default());
    socket.register_listener(listener.clone());
    socket.register_manager(listener.clone());

    let connected = Arc::new(Mutex::new(None));
    let observed = connected.clone();
    socket
        .connect(
            &endpoint(9000),
            &prosock::ConnectOptions::default(),
            Box::new(move |_socket, event| {
                *observed.lock().unwrap() = Some(event);
            }),
        )
        .expect("connect refused");

    // The single-attempt retry timer is the most recent timer.
    let retry = proactor.timer(proactor.timer_count() - 1);
    retry.fire();
    proactor.complete_connect(&socket, Ok(()));
    proactor.pump();

    match connected.lock().unwrap().take() {
        Some(prosock::ConnectEvent::Complete(_)) => {}
        other => panic!("connect did not complete: {:?}", other),
    }
    (socket, listener)
}
