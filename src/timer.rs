//! Process-wide fallback timer and executor service.
//!
//! Sockets create their timers on the proactor so expirations are
//! serviced on the socket's strand. When the proactor back-reference is
//! gone (the engine is shutting down while sockets still wind down),
//! timers and deferred functors fall back to this singleton, a single
//! background thread driving a deadline heap and a work queue.

use lazy_static::lazy_static;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::proactor::{
    Functor, Timer, TimerCallback, TimerEvent, TimerEventType, TimerOptions,
};
use crate::Error;

lazy_static! {
    static ref SERVICE: AsyncService = AsyncService::new();
}

/// Run `f` on the fallback service thread.
pub(crate) fn execute(f: Functor) {
    SERVICE.execute(f);
}

/// Create a timer serviced by the fallback service thread.
pub(crate) fn create_timer(options: TimerOptions, callback: TimerCallback) -> Arc<dyn Timer> {
    SERVICE.create_timer(options, callback)
}

struct Scheduled {
    due: Instant,
    generation: u64,
    timer: Weak<AsyncTimer>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.generation == other.generation
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the earliest deadline surfaces first in the max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then(other.generation.cmp(&self.generation))
    }
}

struct ServiceState {
    timers: BinaryHeap<Scheduled>,
    work: VecDeque<Functor>,
    running: bool,
}

struct AsyncService {
    state: Mutex<ServiceState>,
    signal: Condvar,
}

impl AsyncService {
    fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState {
                timers: BinaryHeap::new(),
                work: VecDeque::new(),
                running: false,
            }),
            signal: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_thread(&self, state: &mut ServiceState) {
        if !state.running {
            state.running = true;
            thread::Builder::new()
                .name("prosock-async".into())
                .spawn(|| SERVICE.run())
                .ok();
        }
    }

    fn execute(&self, f: Functor) {
        let mut state = self.lock();
        self.ensure_thread(&mut state);
        state.work.push_back(f);
        self.signal.notify_one();
    }

    fn create_timer(&'static self, options: TimerOptions, callback: TimerCallback) -> Arc<dyn Timer> {
        Arc::new_cyclic(|weak: &Weak<AsyncTimer>| AsyncTimer {
            service: self,
            options,
            callback,
            weak_self: weak.clone(),
            state: Mutex::new(AsyncTimerState {
                deadline: None,
                period: None,
                generation: 0,
                closed: false,
            }),
        })
    }

    fn insert(&self, entry: Scheduled) {
        let mut state = self.lock();
        self.ensure_thread(&mut state);
        state.timers.push(entry);
        self.signal.notify_one();
    }

    fn run(&self) {
        loop {
            let mut due = Vec::new();
            let mut work = Vec::new();
            let timeout;
            {
                let mut state = self.lock();
                let now = Instant::now();
                while let Some(top) = state.timers.peek() {
                    if top.due <= now {
                        if let Some(entry) = state.timers.pop() {
                            due.push(entry);
                        }
                    } else {
                        break;
                    }
                }
                work.extend(state.work.drain(..));
                timeout = state
                    .timers
                    .peek()
                    .map(|top| top.due.saturating_duration_since(now));
            }
            for f in work {
                f();
            }
            for entry in due {
                if let Some(timer) = entry.timer.upgrade() {
                    timer.fire(entry.due, entry.generation);
                }
            }
            let state = self.lock();
            match timeout {
                Some(timeout) => {
                    let _unused = self
                        .signal
                        .wait_timeout(state, timeout.max(Duration::from_millis(1)));
                }
                None => {
                    let _unused = self.signal.wait(state);
                }
            }
        }
    }
}

struct AsyncTimerState {
    deadline: Option<Instant>,
    period: Option<Duration>,
    generation: u64,
    closed: bool,
}

struct AsyncTimer {
    service: &'static AsyncService,
    options: TimerOptions,
    callback: TimerCallback,
    weak_self: Weak<AsyncTimer>,
    state: Mutex<AsyncTimerState>,
}

impl AsyncTimer {
    fn lock(&self) -> MutexGuard<'_, AsyncTimerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fire(&self, due: Instant, generation: u64) {
        {
            let mut state = self.lock();
            if state.closed || state.generation != generation || state.deadline != Some(due) {
                return;
            }
            match (self.options.one_shot, state.period) {
                (false, Some(period)) => {
                    let next = due + period;
                    state.deadline = Some(next);
                    self.service.insert(Scheduled {
                        due: next,
                        generation,
                        timer: self.weak_self.clone(),
                    });
                }
                _ => {
                    state.deadline = None;
                }
            }
        }
        (self.callback)(&TimerEvent {
            kind: TimerEventType::Deadline,
            deadline: Some(due),
        });
    }
}

impl Timer for AsyncTimer {
    fn schedule(&self, deadline: Instant, period: Option<Duration>) -> Result<(), Error> {
        let generation;
        {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::Invalid);
            }
            state.generation += 1;
            state.deadline = Some(deadline);
            state.period = period;
            generation = state.generation;
        }
        self.service.insert(Scheduled {
            due: deadline,
            generation,
            timer: self.weak_self.clone(),
        });
        Ok(())
    }

    fn cancel(&self) -> Result<(), Error> {
        let was_armed;
        {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::Invalid);
            }
            was_armed = state.deadline.take().is_some();
            state.generation += 1;
        }
        if was_armed && self.options.show_cancelled {
            (self.callback)(&TimerEvent {
                kind: TimerEventType::Cancelled,
                deadline: None,
            });
        }
        Ok(())
    }

    fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.deadline = None;
            state.generation += 1;
        }
        if self.options.show_closed {
            (self.callback)(&TimerEvent {
                kind: TimerEventType::Closed,
                deadline: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn one_shot_timer_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        let timer = create_timer(
            TimerOptions::default(),
            Arc::new(move |event| {
                if event.kind == TimerEventType::Deadline {
                    observed.fetch_add(1, AtomicOrdering::SeqCst);
                }
            }),
        );
        timer
            .schedule(Instant::now() + Duration::from_millis(10), None)
            .ok();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
        timer.close();
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        let timer = create_timer(
            TimerOptions::default(),
            Arc::new(move |event| {
                if event.kind == TimerEventType::Deadline {
                    observed.fetch_add(1, AtomicOrdering::SeqCst);
                }
            }),
        );
        timer
            .schedule(Instant::now() + Duration::from_millis(30), None)
            .ok();
        timer.cancel().ok();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
        timer.close();
    }

    #[test]
    fn executor_runs_functors() {
        let ran = Arc::new(AtomicUsize::new(0));
        let observed = ran.clone();
        execute(Box::new(move || {
            observed.fetch_add(1, AtomicOrdering::SeqCst);
        }));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
    }
}
