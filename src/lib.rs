//! Proactor-driven stream sockets with an integrated TLS session layer.
//!
//! This library performs no I/O whatsoever. A [`StreamSocket`] is a state
//! machine that issues asynchronous operations against a completion-based
//! I/O engine (the "proactor") through the collaborator traits in
//! [`proactor`], and consumes the resulting completions through its
//! `process_*` entry points. User code observes the socket through
//! per-operation callbacks and the optional [`SocketListener`] and
//! [`SocketManager`] observers.
//!
//! The TLS layer is a bidirectional record-level state machine,
//! [`Encryption`], that translates between a plaintext stream and a
//! ciphertext stream: the socket pushes received ciphertext in, pops
//! decrypted plaintext out, and sends whatever ciphertext the session
//! emits through its ordinary send path. Upgrading and downgrading a
//! connection are therefore ordinary queue operations, not special I/O
//! modes.

use failure::Fail;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

mod event;
mod limiter;
mod options;
mod proactor;
mod queue;
mod record;
mod session;
mod socket;
mod state;
mod timer;

pub use crate::event::{
    BindCallback, BindContext, BindEvent, CloseCallback, ConnectCallback, ConnectContext,
    ConnectEvent, DowngradeEvent, ErrorContext, ErrorEvent, QueueContext, ReadQueueEvent,
    ReceiveCallback, ReceiveContext, ReceiveEvent, SendCallback, SendContext, SendEvent,
    ShutdownEvent, SocketListener, SocketManager, UpgradeCallback, UpgradeContext, UpgradeEvent,
    WriteQueueEvent,
};
pub use crate::limiter::LeakyBucket;
pub use crate::options::{
    BindOptions, ConnectOptions, GetEndpointOptions, LoadBalancingOptions, ReceiveOptions,
    SendOptions, StreamSocketOptions, UpgradeOptions,
};
pub use crate::proactor::{
    Executor, Functor, GetEndpointCallback, GetEndpointEvent, Proactor, ProactorPool, RateLimiter,
    Resolver, ResolverSource, SystemSocket, Timer, TimerCallback, TimerEvent, TimerEventType,
    TimerOptions,
};
pub use crate::record::{ContentType, RecordHeader};
pub use crate::session::{
    CertificateValidator, Encryption, EncryptionCertificate, EncryptionContext,
    EncryptionContextBuilder, EncryptionContextFactory, EncryptionManager, EncryptionRole,
    EncryptionValidation, HandshakeCallback, HandshakeOutcome,
};
pub use crate::socket::StreamSocket;

/// Every failure observable through this crate maps to one of these
/// conditions. Synchronous operations return it directly; asynchronous
/// operations carry it inside their event context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Fail)]
pub enum Error {
    /// A precondition was violated, typically an operation issued in a
    /// state that does not permit it.
    #[fail(display = "invalid operation for the current state")]
    Invalid,
    /// The operation cannot complete without blocking; retry later or
    /// wait for the corresponding event.
    #[fail(display = "operation would block")]
    WouldBlock,
    #[fail(display = "operation cancelled")]
    Cancelled,
    /// The peer shut down its write side.
    #[fail(display = "end of stream")]
    Eof,
    /// Certificate or authentication failure.
    #[fail(display = "not authorized")]
    NotAuthorized,
    #[fail(display = "connection timed out")]
    ConnectionTimeout,
    #[fail(display = "connection refused")]
    ConnectionRefused,
    /// The connection is known to be unusable, e.g. a silent EPIPE.
    #[fail(display = "connection dead")]
    ConnectionDead,
    #[fail(display = "connection reset by peer")]
    ConnectionReset,
    /// A resource reservation was refused.
    #[fail(display = "resource limit reached")]
    Limit,
    #[fail(display = "not implemented")]
    NotImplemented,
}

/// The flavor of stream transport a socket runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    TcpIpv4,
    TcpIpv6,
    /// Unix-domain (or equivalent) stream socket.
    LocalStream,
}

/// The address of one end of a stream connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ip(SocketAddr),
    Local(PathBuf),
}

impl Endpoint {
    /// The transport implied by this endpoint's address family.
    pub fn transport(&self) -> Transport {
        match *self {
            Endpoint::Ip(SocketAddr::V4(_)) => Transport::TcpIpv4,
            Endpoint::Ip(SocketAddr::V6(_)) => Transport::TcpIpv6,
            Endpoint::Local(_) => Transport::LocalStream,
        }
    }

    pub fn is_ip(&self) -> bool {
        match *self {
            Endpoint::Ip(_) => true,
            Endpoint::Local(_) => false,
        }
    }

    /// Whether connecting to this endpoint can never succeed: the
    /// wildcard address or port zero.
    pub fn is_undefined_target(&self) -> bool {
        match *self {
            Endpoint::Ip(ref addr) => addr.ip().is_unspecified() || addr.port() == 0,
            Endpoint::Local(ref path) => path.as_os_str().is_empty(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Endpoint::Ip(ref addr) => write!(f, "{}", addr),
            Endpoint::Local(ref path) => write!(f, "{}", path.display()),
        }
    }
}

/// Which direction of a socket an operation affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    Send,
    Receive,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let queued writes drain before shutting down the send side.
    Graceful,
    /// Discard queued writes.
    Immediate,
}

/// Which side initiated a shutdown transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOrigin {
    Source,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlType {
    Send,
    Receive,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlMode {
    Immediate,
    Graceful,
}

/// User-supplied correlator for a queued send, usable with
/// [`StreamSocket::cancel_send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendToken(pub u64);

/// User-supplied correlator for a pending receive, usable with
/// [`StreamSocket::cancel_receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiveToken(pub u64);
