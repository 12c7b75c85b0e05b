//! Send and receive queues.
//!
//! The send queue is an ordered list of entries, each owning its payload
//! plus the bookkeeping a queued write needs: a monotonically increasing
//! id, an optional user token, an optional deadline timer, and an
//! optional completion callback. An entry with no payload is the
//! shutdown marker pushed by a graceful send-side shutdown.
//!
//! The receive queue is a single contiguous byte buffer described by an
//! ordered list of record entries (one per transfer, with its arrival
//! timestamp), plus the list of pending-read callback entries waiting
//! for data. The sum of record entry lengths always equals the buffer
//! length.
//!
//! Both queues carry low/high watermarks on byte count. Watermark
//! events are edge-triggered: each authorization fires once per breach
//! and re-arms when the opposite boundary is crossed.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::event::{QueueContext, ReceiveCallback, SendCallback};
use crate::options::ReceiveOptions;
use crate::proactor::Timer;
use crate::{ReceiveToken, SendToken};

pub struct SendQueueEntry {
    pub id: u64,
    pub token: Option<SendToken>,
    /// `None` marks the graceful-shutdown entry.
    pub data: Option<Bytes>,
    pub length: usize,
    pub timestamp: Instant,
    pub deadline: Option<Instant>,
    pub timer: Option<Arc<dyn Timer>>,
    pub callback: Option<SendCallback>,
}

impl SendQueueEntry {
    pub fn marker(id: u64) -> Self {
        Self {
            id,
            token: None,
            data: None,
            length: 0,
            timestamp: Instant::now(),
            deadline: None,
            timer: None,
            callback: None,
        }
    }

    pub fn close_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.close();
        }
        self.deadline = None;
    }
}

pub struct SendQueue {
    entries: VecDeque<SendQueueEntry>,
    size: usize,
    next_id: u64,
    low_watermark: usize,
    high_watermark: usize,
    low_armed: bool,
    high_armed: bool,
}

impl SendQueue {
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            next_id: 1,
            low_watermark,
            high_watermark,
            low_armed: false,
            high_armed: true,
        }
    }

    pub fn generate_entry_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn has_entry(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn low_watermark(&self) -> usize {
        self.low_watermark
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    pub fn set_low_watermark(&mut self, low_watermark: usize) {
        self.low_watermark = low_watermark;
    }

    pub fn set_high_watermark(&mut self, high_watermark: usize) {
        self.high_watermark = high_watermark;
    }

    /// Whether adding `additional` bytes would grow the queue past
    /// `effective_high_watermark`.
    pub fn is_high_watermark_violated_by(
        &self,
        additional: usize,
        effective_high_watermark: usize,
    ) -> bool {
        self.size.saturating_add(additional) > effective_high_watermark
    }

    /// Authorize a high-watermark announcement, at most once per
    /// breach.
    pub fn authorize_high_watermark_event(&mut self) -> bool {
        if self.high_armed {
            self.high_armed = false;
            self.low_armed = true;
            true
        } else {
            false
        }
    }

    /// Authorize the paired low-watermark announcement once the queue
    /// drains to the low watermark after a breach.
    pub fn authorize_low_watermark_event(&mut self) -> bool {
        if self.low_armed && self.size <= self.low_watermark {
            self.low_armed = false;
            self.high_armed = true;
            true
        } else {
            false
        }
    }

    /// Push an entry; returns whether the queue went from empty to
    /// non-empty.
    pub fn push(&mut self, entry: SendQueueEntry) -> bool {
        let was_empty = self.entries.is_empty();
        self.size += entry.length;
        self.entries.push_back(entry);
        was_empty
    }

    pub fn front(&self) -> Option<&SendQueueEntry> {
        self.entries.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut SendQueueEntry> {
        self.entries.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<SendQueueEntry> {
        let entry = self.entries.pop_front();
        if let Some(ref entry) = entry {
            self.size -= entry.length;
        }
        entry
    }

    /// Record a partial completion of the front entry.
    pub fn pop_size(&mut self, amount: usize) {
        if let Some(front) = self.entries.front_mut() {
            let taken = amount.min(front.length);
            front.length -= taken;
            if let Some(ref mut data) = front.data {
                let _ = data.split_to(taken.min(data.len()));
            }
            self.size -= taken;
        }
    }

    /// Remove the entry with the matching token; returns the entry and
    /// whether the queue became empty.
    pub fn remove_token(&mut self, token: SendToken) -> (Option<SendQueueEntry>, bool) {
        self.remove_where(|entry| entry.token == Some(token))
    }

    /// Remove the entry with the matching id; returns the entry and
    /// whether the queue became empty.
    pub fn remove_id(&mut self, id: u64) -> (Option<SendQueueEntry>, bool) {
        self.remove_where(|entry| entry.id == id)
    }

    fn remove_where(
        &mut self,
        predicate: impl Fn(&SendQueueEntry) -> bool,
    ) -> (Option<SendQueueEntry>, bool) {
        let position = self.entries.iter().position(predicate);
        match position {
            Some(index) => {
                let entry = self.entries.remove(index);
                if let Some(ref entry) = entry {
                    self.size -= entry.length;
                }
                (entry, self.entries.is_empty())
            }
            None => (None, false),
        }
    }

    /// Discard every entry; returns them in order and whether any data
    /// was discarded.
    pub fn remove_all(&mut self) -> (Vec<SendQueueEntry>, bool) {
        let discarded = self.size > 0;
        self.size = 0;
        (self.entries.drain(..).collect(), discarded)
    }

    pub fn context(&self) -> QueueContext {
        QueueContext {
            size: self.size,
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiveQueueEntry {
    pub length: usize,
    pub timestamp: Instant,
}

struct ReceiveCallbackState {
    callback: Option<ReceiveCallback>,
    timer: Option<Arc<dyn Timer>>,
}

/// A registered pending read. The callback is one-shot: deadline
/// expiry, cancellation, shutdown, and satisfaction race to `take` it
/// and exactly one wins.
pub struct ReceiveCallbackEntry {
    options: ReceiveOptions,
    state: Mutex<ReceiveCallbackState>,
}

impl ReceiveCallbackEntry {
    pub fn new(callback: ReceiveCallback, options: ReceiveOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            state: Mutex::new(ReceiveCallbackState {
                callback: Some(callback),
                timer: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ReceiveCallbackState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn options(&self) -> ReceiveOptions {
        self.options
    }

    pub fn set_timer(&self, timer: Arc<dyn Timer>) {
        self.lock().timer = Some(timer);
    }

    /// Claim the callback, closing any deadline timer. Returns `None`
    /// if another path already claimed it.
    pub fn take(&self) -> Option<ReceiveCallback> {
        let mut state = self.lock();
        if let Some(timer) = state.timer.take() {
            timer.close();
        }
        state.callback.take()
    }
}

pub struct ReceiveQueue {
    data: BytesMut,
    entries: VecDeque<ReceiveQueueEntry>,
    callbacks: VecDeque<Arc<ReceiveCallbackEntry>>,
    low_watermark: usize,
    high_watermark: usize,
    low_armed: bool,
    high_armed: bool,
}

impl ReceiveQueue {
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            data: BytesMut::new(),
            entries: VecDeque::new(),
            callbacks: VecDeque::new(),
            low_watermark,
            high_watermark,
            low_armed: true,
            high_armed: true,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn has_entry(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn low_watermark(&self) -> usize {
        self.low_watermark
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    pub fn set_low_watermark(&mut self, low_watermark: usize) {
        self.low_watermark = low_watermark;
        if self.size() < self.low_watermark {
            self.low_armed = true;
        }
    }

    pub fn set_high_watermark(&mut self, high_watermark: usize) {
        self.high_watermark = high_watermark;
        if self.size() < self.high_watermark {
            self.high_armed = true;
        }
    }

    pub fn is_low_watermark_satisfied(&self) -> bool {
        self.size() >= self.low_watermark
    }

    pub fn is_high_watermark_violated(&self) -> bool {
        self.size() >= self.high_watermark
    }

    /// Authorize a low-watermark announcement: enough data has
    /// accumulated for a reader, at most once until the queue drains
    /// below the low watermark again.
    pub fn authorize_low_watermark_event(&mut self) -> bool {
        if self.low_armed && self.is_low_watermark_satisfied() {
            self.low_armed = false;
            true
        } else {
            false
        }
    }

    pub fn authorize_high_watermark_event(&mut self) -> bool {
        if self.high_armed && self.is_high_watermark_violated() {
            self.high_armed = false;
            true
        } else {
            false
        }
    }

    /// Append raw bytes without recording an entry; the caller follows
    /// up with `push_entry` for the net growth.
    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    pub fn push_entry(&mut self, length: usize, timestamp: Instant) {
        debug_assert!(length > 0);
        self.entries.push_back(ReceiveQueueEntry { length, timestamp });
        debug_assert_eq!(self.total_entry_length(), self.data.len());
    }

    pub fn front_entry(&self) -> Option<&ReceiveQueueEntry> {
        self.entries.front()
    }

    /// Replace all record entries with a single entry spanning the
    /// whole buffer, keeping `timestamp`. Used when an upgrade re-forms
    /// the queue from decrypted plaintext.
    pub fn reform(&mut self, timestamp: Instant) {
        self.entries.clear();
        if !self.data.is_empty() {
            let length = self.data.len();
            self.entries.push_back(ReceiveQueueEntry { length, timestamp });
        }
    }

    /// Take the whole buffer, clearing all record entries. Used when an
    /// upgrade treats queued bytes as ciphertext.
    pub fn take_data(&mut self) -> Bytes {
        self.entries.clear();
        self.rearm_after_drain();
        self.data.split_to(self.data.len()).freeze()
    }

    /// Dequeue up to `max_size` bytes across however many record
    /// entries are required, returning one contiguous block.
    pub fn dequeue(&mut self, max_size: usize) -> Bytes {
        let mut remaining = max_size;
        let mut dequeued = 0;
        while remaining > 0 {
            let finished = match self.entries.front_mut() {
                Some(front) => {
                    let taken = remaining.min(front.length);
                    front.length -= taken;
                    dequeued += taken;
                    remaining -= taken;
                    front.length == 0
                }
                None => break,
            };
            if finished {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        let block = self.data.split_to(dequeued).freeze();
        debug_assert_eq!(self.total_entry_length(), self.data.len());
        self.rearm_after_drain();
        block
    }

    fn rearm_after_drain(&mut self) {
        if self.size() < self.low_watermark {
            self.low_armed = true;
        }
        if self.size() < self.high_watermark {
            self.high_armed = true;
        }
    }

    fn total_entry_length(&self) -> usize {
        self.entries.iter().map(|entry| entry.length).sum()
    }

    pub fn has_callback_entry(&self) -> bool {
        !self.callbacks.is_empty()
    }

    pub fn push_callback_entry(&mut self, entry: Arc<ReceiveCallbackEntry>) {
        self.callbacks.push_back(entry);
    }

    /// Pop the front callback entry if the queued data satisfies its
    /// minimum size.
    pub fn pop_callback_entry(&mut self) -> Option<Arc<ReceiveCallbackEntry>> {
        let satisfied = self
            .callbacks
            .front()
            .map(|entry| self.size() >= entry.options().min_size)
            .unwrap_or(false);
        if satisfied {
            self.callbacks.pop_front()
        } else {
            None
        }
    }

    pub fn remove_callback_token(
        &mut self,
        token: ReceiveToken,
    ) -> Option<Arc<ReceiveCallbackEntry>> {
        let position = self
            .callbacks
            .iter()
            .position(|entry| entry.options().token == Some(token));
        position.and_then(|index| self.callbacks.remove(index))
    }

    pub fn remove_callback_entry(&mut self, entry: &Arc<ReceiveCallbackEntry>) -> bool {
        let position = self
            .callbacks
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, entry));
        match position {
            Some(index) => {
                self.callbacks.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn pop_all_callback_entries(&mut self) -> Vec<Arc<ReceiveCallbackEntry>> {
        self.callbacks.drain(..).collect()
    }

    pub fn context(&self) -> QueueContext {
        QueueContext {
            size: self.size(),
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
        }
    }
}
