//! Small per-socket state machines: open state, flow control, shutdown
//! tracking, detach tracking, and the receive-size feedback estimator.

use crate::ShutdownOrigin;
use std::cmp;

/// Lifecycle of a socket's connection to its remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenState {
    /// Freshly constructed; no connect issued yet.
    Default,
    /// A connect operation has been accepted and is waiting for its
    /// next attempt to be dispatched.
    Waiting,
    /// An attempt is in flight.
    Connecting,
    Connected,
    Closed,
}

impl OpenState {
    pub fn can_connect(self) -> bool {
        self == OpenState::Default
    }

    pub fn can_send(self) -> bool {
        self == OpenState::Connected
    }

    pub fn can_receive(self) -> bool {
        self == OpenState::Connected
    }
}

/// The enable decisions that resulted from a flow-control transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowControlContext {
    pub enable_send: bool,
    pub enable_receive: bool,
}

/// Per-direction enablement of new proactor transfers.
///
/// Each direction carries a soft lock bit set by internal throttling
/// (rate limiters, terminal close). A relax without `unlock` cannot
/// re-enable a locked direction, so external policy changes cannot
/// accidentally override internal throttling.
#[derive(Debug, Clone, Copy)]
pub struct FlowControlState {
    enable_send: bool,
    enable_receive: bool,
    lock_send: bool,
    lock_receive: bool,
    closed: bool,
}

impl FlowControlState {
    pub fn new() -> Self {
        Self {
            enable_send: false,
            enable_receive: false,
            lock_send: false,
            lock_receive: false,
            closed: false,
        }
    }

    pub fn want_send(&self) -> bool {
        self.enable_send
    }

    pub fn want_receive(&self) -> bool {
        self.enable_receive
    }

    /// Enable directions, returning whether anything changed.
    pub fn relax(
        &mut self,
        context: &mut FlowControlContext,
        send: bool,
        receive: bool,
        unlock: bool,
    ) -> bool {
        if self.closed {
            return false;
        }
        let mut changed = false;
        if send {
            if unlock {
                self.lock_send = false;
            }
            if !self.lock_send && !self.enable_send {
                self.enable_send = true;
                changed = true;
            }
        }
        if receive {
            if unlock {
                self.lock_receive = false;
            }
            if !self.lock_receive && !self.enable_receive {
                self.enable_receive = true;
                changed = true;
            }
        }
        context.enable_send = self.enable_send;
        context.enable_receive = self.enable_receive;
        changed
    }

    /// Disable directions, returning whether anything changed.
    pub fn apply(
        &mut self,
        context: &mut FlowControlContext,
        send: bool,
        receive: bool,
        lock: bool,
    ) -> bool {
        let mut changed = false;
        if send {
            if lock {
                self.lock_send = true;
            }
            if self.enable_send {
                self.enable_send = false;
                changed = true;
            }
        }
        if receive {
            if lock {
                self.lock_receive = true;
            }
            if self.enable_receive {
                self.enable_receive = false;
                changed = true;
            }
        }
        context.enable_send = self.enable_send;
        context.enable_receive = self.enable_receive;
        changed
    }

    /// Permanently disable both directions.
    pub fn close(&mut self) {
        self.enable_send = false;
        self.enable_receive = false;
        self.lock_send = true;
        self.lock_receive = true;
        self.closed = true;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// What a shutdown transition requires the socket to announce.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownContext {
    pub origin: ShutdownOrigin,
    /// This transition began the overall shutdown.
    pub initiated: bool,
    /// The send direction newly shut down.
    pub send: bool,
    /// The receive direction newly shut down.
    pub receive: bool,
    /// Both directions are now shut down.
    pub completed: bool,
}

impl ShutdownContext {
    fn new(origin: ShutdownOrigin) -> Self {
        Self {
            origin,
            initiated: false,
            send: false,
            receive: false,
            completed: false,
        }
    }
}

/// Directional shutdown progress with keep-half-open policy.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownState {
    send_initiated: bool,
    send_completed: bool,
    receive_initiated: bool,
    receive_completed: bool,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            send_initiated: false,
            send_completed: false,
            receive_initiated: false,
            receive_completed: false,
        }
    }

    pub fn can_send(&self) -> bool {
        !self.send_initiated
    }

    pub fn can_receive(&self) -> bool {
        !self.receive_initiated
    }

    pub fn completed(&self) -> bool {
        self.send_completed && self.receive_completed
    }

    /// Attempt to shut down the send direction. Returns whether a new
    /// transition occurred and fills `context` with the announcements it
    /// requires. With `keep_half_open` false the receive direction is
    /// shut down as well.
    pub fn try_shutdown_send(
        &mut self,
        context: &mut ShutdownContext,
        keep_half_open: bool,
    ) -> bool {
        if self.send_initiated {
            return false;
        }
        *context = ShutdownContext::new(ShutdownOrigin::Source);
        context.initiated = !self.receive_initiated;
        self.send_initiated = true;
        self.send_completed = true;
        context.send = true;
        if !keep_half_open && !self.receive_initiated {
            self.receive_initiated = true;
            self.receive_completed = true;
            context.receive = true;
        }
        context.completed = self.completed();
        true
    }

    /// Attempt to shut down the receive direction; `origin` records
    /// whether the local or remote side drove the transition.
    pub fn try_shutdown_receive(
        &mut self,
        context: &mut ShutdownContext,
        keep_half_open: bool,
        origin: ShutdownOrigin,
    ) -> bool {
        if self.receive_initiated {
            return false;
        }
        *context = ShutdownContext::new(origin);
        context.initiated = !self.send_initiated;
        self.receive_initiated = true;
        self.receive_completed = true;
        context.receive = true;
        if !keep_half_open && !self.send_initiated {
            self.send_initiated = true;
            self.send_completed = true;
            context.send = true;
        }
        context.completed = self.completed();
        true
    }

    /// Mark both directions shut down without generating announcements.
    pub fn close(&mut self) {
        self.send_initiated = true;
        self.send_completed = true;
        self.receive_initiated = true;
        self.receive_completed = true;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Whether an asynchronous proactor detach is in flight. While
/// `DetachInitiated`, completion events are dropped or deferred and the
/// single deferred-call slot holds the continuation to run once
/// `process_socket_detached` fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachState {
    Idle,
    DetachInitiated,
}

/// Coarse estimator of upcoming receive sizes from recently observed
/// transfers.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveFeedback {
    current: usize,
    maximum: usize,
}

impl ReceiveFeedback {
    pub fn new() -> Self {
        Self {
            current: 0,
            maximum: 0,
        }
    }

    pub fn set_feedback(&mut self, attempted: usize, received: usize) {
        let _ = attempted;
        self.current = received;
        self.maximum = cmp::max(self.maximum, received);
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn maximum(&self) -> usize {
        self.maximum
    }

    /// The next receive size: bracketed below by the read queue low
    /// watermark (so one transfer can satisfy a waiting reader) and
    /// above by the configured transfer bounds, never less than one
    /// byte.
    pub fn receive_size(
        &self,
        low_watermark: usize,
        min_transfer: usize,
        max_transfer: usize,
    ) -> usize {
        let wanted = cmp::max(low_watermark, self.maximum);
        let bounded = cmp::min(cmp::max(wanted, min_transfer), cmp::max(max_transfer, 1));
        cmp::max(bounded, 1)
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
