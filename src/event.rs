//! Events announced to user callbacks and session observers.
//!
//! Each asynchronous operation completes with exactly one event carrying
//! a context that describes the outcome and any protocol-specific
//! diagnostics. Queue events additionally carry a snapshot of the queue
//! they describe.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::proactor::ResolverSource;
use crate::socket::StreamSocket;
use crate::{Endpoint, Error, ShutdownOrigin, Transport};

/// Diagnostics accompanying a connect completion.
#[derive(Debug, Clone, Default)]
pub struct ConnectContext {
    pub error: Option<Error>,
    /// Attempts that would still have been made had the operation not
    /// completed.
    pub attempts_remaining: usize,
    /// The name the user connected to, when resolution was involved.
    pub name: Option<String>,
    /// The transport endpoint of the attempt.
    pub endpoint: Option<Endpoint>,
    /// Wall-clock duration from the connect call to completion.
    pub latency: Option<Duration>,
    /// The name server that supplied the resolution, when known.
    pub name_server: Option<Endpoint>,
    /// Where the resolution came from.
    pub source: Option<ResolverSource>,
}

#[derive(Debug, Clone)]
pub enum ConnectEvent {
    Complete(ConnectContext),
    Error(ConnectContext),
}

impl ConnectEvent {
    pub fn context(&self) -> &ConnectContext {
        match *self {
            ConnectEvent::Complete(ref ctx) | ConnectEvent::Error(ref ctx) => ctx,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BindContext {
    pub error: Option<Error>,
    pub name: Option<String>,
    pub endpoint: Option<Endpoint>,
}

#[derive(Debug, Clone)]
pub enum BindEvent {
    Complete(BindContext),
    Error(BindContext),
}

#[derive(Debug, Clone, Default)]
pub struct SendContext {
    pub error: Option<Error>,
}

#[derive(Debug, Clone)]
pub enum SendEvent {
    Complete(SendContext),
    Error(SendContext),
}

#[derive(Debug, Clone)]
pub struct ReceiveContext {
    pub error: Option<Error>,
    pub transport: Transport,
    pub endpoint: Option<Endpoint>,
}

#[derive(Debug, Clone)]
pub enum ReceiveEvent {
    Complete(ReceiveContext),
    Error(ReceiveContext),
}

impl ReceiveEvent {
    pub fn context(&self) -> &ReceiveContext {
        match *self {
            ReceiveEvent::Complete(ref ctx) | ReceiveEvent::Error(ref ctx) => ctx,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeContext {
    pub error: Option<Error>,
    /// Human-readable description of a handshake failure.
    pub error_description: String,
}

#[derive(Debug, Clone)]
pub enum UpgradeEvent {
    Complete(UpgradeContext),
    Error(UpgradeContext),
}

/// Shutdown progress, announced in a fixed order: `Initiated`, then
/// `Send` and/or `Receive`, then `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownEvent {
    Initiated(ShutdownOrigin),
    Send(ShutdownOrigin),
    Receive(ShutdownOrigin),
    Complete(ShutdownOrigin),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DowngradeEvent {
    Initiated,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorContext {
    pub error: Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorEvent {
    /// A failure of the underlying transport.
    Transport(ErrorContext),
}

/// Snapshot of a queue at the moment an event was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueContext {
    pub size: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteQueueEvent {
    LowWatermark(QueueContext),
    HighWatermark(QueueContext),
    FlowControlRelaxed(QueueContext),
    FlowControlApplied(QueueContext),
    RateLimitApplied(QueueContext),
    RateLimitRelaxed(QueueContext),
    /// Queued writes were discarded by a shutdown.
    Discarded(QueueContext),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadQueueEvent {
    LowWatermark(QueueContext),
    HighWatermark(QueueContext),
    FlowControlRelaxed(QueueContext),
    FlowControlApplied(QueueContext),
    RateLimitApplied(QueueContext),
    RateLimitRelaxed(QueueContext),
}

/// Observer of a socket's queue, shutdown, downgrade, and error events.
///
/// All methods default to no-ops so implementations subscribe only to
/// what they need.
pub trait SocketListener: Send + Sync {
    fn on_read_queue(&self, socket: &Arc<StreamSocket>, event: ReadQueueEvent) {
        let _ = (socket, event);
    }
    fn on_write_queue(&self, socket: &Arc<StreamSocket>, event: WriteQueueEvent) {
        let _ = (socket, event);
    }
    fn on_shutdown(&self, socket: &Arc<StreamSocket>, event: ShutdownEvent) {
        let _ = (socket, event);
    }
    fn on_downgrade(&self, socket: &Arc<StreamSocket>, event: DowngradeEvent) {
        let _ = (socket, event);
    }
    fn on_error(&self, socket: &Arc<StreamSocket>, event: ErrorEvent) {
        let _ = (socket, event);
    }
}

/// Observer of a socket's lifetime, typically the entity that owns a set
/// of sockets.
pub trait SocketManager: Send + Sync {
    fn on_established(&self, socket: &Arc<StreamSocket>) {
        let _ = socket;
    }
    fn on_closed(&self, socket: &Arc<StreamSocket>) {
        let _ = socket;
    }
}

pub type ConnectCallback = Box<dyn FnOnce(&Arc<StreamSocket>, ConnectEvent) + Send>;
pub type BindCallback = Box<dyn FnOnce(&Arc<StreamSocket>, BindEvent) + Send>;
pub type SendCallback = Box<dyn FnOnce(&Arc<StreamSocket>, SendEvent) + Send>;
pub type ReceiveCallback = Box<dyn FnOnce(&Arc<StreamSocket>, Option<Bytes>, ReceiveEvent) + Send>;
pub type UpgradeCallback = Box<dyn FnOnce(&Arc<StreamSocket>, UpgradeEvent) + Send>;
pub type CloseCallback = Box<dyn FnOnce(&Arc<StreamSocket>) + Send>;
