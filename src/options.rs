use std::time::{Duration, Instant};

use crate::session::EncryptionValidation;
use crate::{Endpoint, ReceiveToken, SendToken, Transport};

/// Parameters governing a stream socket for its whole lifetime.
#[derive(Debug, Clone)]
pub struct StreamSocketOptions {
    pub transport: Transport,
    /// Bound before connecting when set; otherwise the kernel assigns an
    /// ephemeral source endpoint.
    pub source_endpoint: Option<Endpoint>,
    pub reuse_address: bool,
    /// Keep the opposite direction open when one direction shuts down.
    /// Overridden to `false` by `abortive_close`. Unset means the
    /// process-wide default of `false`.
    pub keep_half_open: Option<bool>,
    /// Skip the native shutdown handshake entirely and release the
    /// connection with prejudice.
    pub abortive_close: bool,
    /// Hint to the proactor to copy as much of the write queue into the
    /// kernel per operation as it will take.
    pub send_greedily: bool,
    /// Hint to the proactor to drain the kernel receive buffer per
    /// operation rather than performing a single transfer.
    pub receive_greedily: bool,
    /// Write queue size at or below which a low-watermark event is
    /// announced after a high-watermark breach.
    pub write_queue_low_watermark: usize,
    /// Write queue size that `send` refuses to grow past.
    pub write_queue_high_watermark: usize,
    /// Read queue size that must accumulate before a low-watermark event
    /// is announced.
    pub read_queue_low_watermark: usize,
    /// Read queue size past which receive flow control is applied until
    /// the user drains the queue.
    pub read_queue_high_watermark: usize,
    /// Smallest single receive the socket will issue to the proactor.
    pub min_incoming_stream_transfer_size: usize,
    /// Largest single receive the socket will issue to the proactor.
    pub max_incoming_stream_transfer_size: usize,
    /// Forwarded to the proactor pool when the socket releases its
    /// proactor lease on terminal close.
    pub load_balancing: LoadBalancingOptions,
    /// Whether per-socket metrics should be collected by the runtime
    /// that hosts this socket.
    pub metrics: bool,
}

impl Default for StreamSocketOptions {
    fn default() -> Self {
        Self {
            transport: Transport::TcpIpv4,
            source_endpoint: None,
            reuse_address: false,
            keep_half_open: None,
            abortive_close: false,
            send_greedily: false,
            receive_greedily: false,
            write_queue_low_watermark: 0,
            // Large enough to absorb a burst from a well-behaved writer
            // while still bounding memory per connection.
            write_queue_high_watermark: 4 * 1024 * 1024,
            read_queue_low_watermark: 1,
            read_queue_high_watermark: 4 * 1024 * 1024,
            min_incoming_stream_transfer_size: 1,
            // A full kernel receive buffer on most systems.
            max_incoming_stream_transfer_size: 64 * 1024,
            load_balancing: LoadBalancingOptions::default(),
            metrics: false,
        }
    }
}

/// Parameters of the proactor-pool lease release performed at terminal
/// close.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadBalancingOptions {
    /// Pool-specific weight adjustment applied when the lease is
    /// returned.
    pub weight: Option<usize>,
}

/// Parameters of a single connect operation.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Number of additional attempts after the initial one. Unset means
    /// a single attempt.
    pub retry_count: Option<usize>,
    /// Delay between attempts. Unset with retries means back-to-back
    /// attempts.
    pub retry_interval: Option<Duration>,
    /// Overall deadline for the whole operation across all attempts.
    pub deadline: Option<Instant>,
}

/// Parameters of a TLS upgrade.
#[derive(Clone, Default)]
pub struct UpgradeOptions {
    /// Server name announced by the client in the TLS handshake and used
    /// by servers to dispatch to the matching context.
    pub server_name: Option<String>,
    /// Overrides the context's certificate validation policy for this
    /// session.
    pub validation: Option<EncryptionValidation>,
    /// Preserve bytes that trail the final TLS record so the user can
    /// pop them after the downgrade completes.
    pub keep_incoming_leftovers: bool,
    /// Divert plaintext submitted during the handshake and return it to
    /// the user if the handshake fails.
    pub keep_outgoing_leftovers: bool,
    pub deadline: Option<Instant>,
}

impl std::fmt::Debug for UpgradeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeOptions")
            .field("server_name", &self.server_name)
            .field("keep_incoming_leftovers", &self.keep_incoming_leftovers)
            .field("keep_outgoing_leftovers", &self.keep_outgoing_leftovers)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Parameters of a single send operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub token: Option<SendToken>,
    /// Deadline by which the write must have started draining into the
    /// kernel; expiry removes it from the queue with `WouldBlock`.
    pub deadline: Option<Instant>,
    /// Per-call override of the write queue high watermark.
    pub high_watermark: Option<usize>,
    /// Allow the completion callback to run inside the calling frame
    /// instead of being deferred to the socket's strand.
    pub recurse: bool,
}

/// Parameters of a single receive operation.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveOptions {
    /// The callback is not invoked until at least this many bytes are
    /// available.
    pub min_size: usize,
    /// At most this many bytes are returned in one completion.
    pub max_size: usize,
    pub token: Option<ReceiveToken>,
    pub deadline: Option<Instant>,
    pub recurse: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: usize::max_value(),
            token: None,
            deadline: None,
            recurse: false,
        }
    }
}

/// Parameters of a bind operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BindOptions {
    pub recurse: bool,
}

/// Parameters forwarded to the resolver when a connect or bind target is
/// given by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetEndpointOptions {
    /// Restrict resolution to addresses usable with this transport.
    pub transport: Option<Transport>,
}
