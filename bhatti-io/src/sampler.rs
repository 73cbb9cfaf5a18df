//! Sampling scheduler
//!
//! Polls one channel at a fixed rate on a dedicated thread and hands the
//! results back to the owning thread through a bounded event queue.
//!
//! # Thread Model
//!
//! ```text
//!   owner thread                        "sampler" thread
//!   ────────────                        ────────────────
//!   start(interval) ── open channel
//!                   ── spawn ─────────► tick: channel.read()
//!                                         ok   → counter = 0, post Sample
//!                                         none → nothing
//!                                         err  → counter += 1
//!                                                counter ≥ 3 → post Error, close, exit
//!   dispatch_pending() ◄── events ──────
//!     on_sample / on_error
//!   stop() ── cancel ─────────────────► exits before the next tick
//!          ── join (2 s) → close channel
//! ```
//!
//! Callbacks never run on the sampler thread. A full event queue drops the
//! sample with a warning so a slow owner never delays the next poll; an
//! escalation evicts the oldest queued event instead of being dropped.

use crate::core::{Channel, Sample, SharedChannel, Worker};
use crate::error::{DeviceError, DeviceResult};
use crossbeam_channel::{
    Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Consecutive read failures that stop the sampler
pub const ERROR_THRESHOLD: u32 = 3;

/// Bounded wait for the sampler thread in `stop()`
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait for the channel lock when closing
const CLOSE_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Events held for the owner before samples start being dropped
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Result of one tick, handed to the owning thread
#[derive(Debug)]
pub enum SamplerEvent {
    /// Successful reading
    Sample(Sample),
    /// Escalated failure; the sampler has stopped
    Error(DeviceError),
}

pub type SampleCallback = Box<dyn FnMut(Sample) + Send>;
pub type ErrorCallback = Box<dyn FnMut(&DeviceError) + Send>;

/// State shared with the sampler thread
struct State {
    running: AtomicBool,
    errors: AtomicU32,
    started_at: Mutex<Option<Instant>>,
}

struct Task {
    cancel: Sender<()>,
    worker: Worker,
}

/// Periodic poller for one channel
///
/// All methods take `&self`, so a sampler can be shared (e.g. in an `Arc`)
/// and stopped from any thread.
pub struct Sampler {
    channel: Arc<Mutex<Option<SharedChannel>>>,
    on_sample: Mutex<Option<SampleCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    state: Arc<State>,
    events_tx: Sender<SamplerEvent>,
    events_rx: Receiver<SamplerEvent>,
    task: Mutex<Option<Task>>,
}

impl Sampler {
    pub fn new() -> Self {
        let (events_tx, events_rx) = bounded(EVENT_QUEUE_CAPACITY);
        Self {
            channel: Arc::new(Mutex::new(None)),
            on_sample: Mutex::new(None),
            on_error: Mutex::new(None),
            state: Arc::new(State {
                running: AtomicBool::new(false),
                errors: AtomicU32::new(0),
                started_at: Mutex::new(None),
            }),
            events_tx,
            events_rx,
            task: Mutex::new(None),
        }
    }

    /// Replace the polled channel
    ///
    /// Takes effect from the next tick. The previous channel is not closed.
    pub fn set_channel(&self, channel: SharedChannel) {
        *self.channel.lock() = Some(channel);
    }

    /// Currently polled channel
    pub fn channel(&self) -> Option<SharedChannel> {
        self.channel.lock().clone()
    }

    pub fn set_on_sample(&self, callback: impl FnMut(Sample) + Send + 'static) {
        *self.on_sample.lock() = Some(Box::new(callback));
    }

    pub fn set_on_error(&self, callback: impl FnMut(&DeviceError) + Send + 'static) {
        *self.on_error.lock() = Some(Box::new(callback));
    }

    /// Start polling every `interval`; no-op while running
    ///
    /// Opens the channel if needed. An open failure is reported to the error
    /// callback right away (on the calling thread) and returned; nothing is
    /// scheduled and nothing is retried.
    pub fn start(&self, interval: Duration) -> DeviceResult<()> {
        let mut task = self.task.lock();
        if self.state.running.load(Ordering::Acquire) {
            return Ok(());
        }
        if interval.is_zero() {
            return Err(DeviceError::Config("sampling interval must be positive".to_string()));
        }

        // Thread left over from an escalation has already exited its loop
        if let Some(old) = task.take() {
            drop(old.cancel);
            old.worker.join_timeout(STOP_TIMEOUT);
        }

        if let Err(e) = self.open_channel() {
            // The callback may call back into the sampler
            drop(task);
            log::error!("Sampler start failed: {}", e);
            self.notify_error(&e);
            return Err(e);
        }

        self.state.errors.store(0, Ordering::Release);
        *self.state.started_at.lock() = Some(Instant::now());
        self.state.running.store(true, Ordering::Release);

        let (cancel, cancelled) = bounded::<()>(1);
        let channel = Arc::clone(&self.channel);
        let state = Arc::clone(&self.state);
        let events = Events {
            tx: self.events_tx.clone(),
            backlog: self.events_rx.clone(),
        };
        let worker = Worker::spawn("sampler", move || {
            run(channel, state, events, cancelled, interval)
        })
        .map_err(|e| {
            self.state.running.store(false, Ordering::Release);
            DeviceError::Io(e)
        })?;

        *task = Some(Task { cancel, worker });
        log::info!("Sampler started ({:?} interval)", interval);
        Ok(())
    }

    fn open_channel(&self) -> DeviceResult<()> {
        let channel = self
            .channel
            .lock()
            .clone()
            .ok_or_else(|| DeviceError::Config("no channel selected".to_string()))?;
        let mut channel = channel.lock();
        if !channel.is_open() {
            channel.open()?;
            log::info!("Opened {}", channel.description());
        }
        Ok(())
    }

    /// Stop polling and close the channel; idempotent, callable from any thread
    ///
    /// No tick starts after this returns. A read already in progress gets
    /// up to 2 s to finish before the thread is detached.
    pub fn stop(&self) {
        let task = self.task.lock().take();
        self.state.running.store(false, Ordering::Release);

        let Some(Task { cancel, worker }) = task else {
            return;
        };
        drop(cancel);
        if !worker.join_timeout(STOP_TIMEOUT) {
            log::warn!("Sampler thread still busy after {:?}", STOP_TIMEOUT);
        }

        if let Some(channel) = self.channel() {
            match channel.try_lock_for(CLOSE_LOCK_TIMEOUT) {
                Some(mut channel) => channel.close(),
                None => log::warn!("Channel busy, left open"),
            }
        }
        log::info!("Sampler stopped");
    }

    /// Whether ticks are being scheduled
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Milliseconds since the last successful `start()`, 0 if never started
    pub fn elapsed_ms(&self) -> u64 {
        self.state
            .started_at
            .lock()
            .map_or(0, |t| t.elapsed().as_millis() as u64)
    }

    /// Consecutive failures in the current streak
    pub fn error_count(&self) -> u32 {
        self.state.errors.load(Ordering::Acquire)
    }

    /// Receiver for owners running their own event loop instead of the
    /// `dispatch_*` helpers
    pub fn events(&self) -> Receiver<SamplerEvent> {
        self.events_rx.clone()
    }

    /// Run callbacks for every queued event without blocking
    ///
    /// Returns the number of events handled. A callback may call any sampler
    /// method, including replacing itself.
    pub fn dispatch_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => {
                    self.dispatch(event);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return handled,
            }
        }
    }

    /// Wait up to `timeout` for an event, then dispatch everything queued
    pub fn dispatch_timeout(&self, timeout: Duration) -> usize {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.dispatch(event);
                1 + self.dispatch_pending()
            }
            Err(_) => 0,
        }
    }

    fn dispatch(&self, event: SamplerEvent) {
        match event {
            SamplerEvent::Sample(sample) => {
                let taken = self.on_sample.lock().take();
                if let Some(mut callback) = taken {
                    callback(sample);
                    let mut slot = self.on_sample.lock();
                    if slot.is_none() {
                        *slot = Some(callback);
                    }
                }
            }
            SamplerEvent::Error(error) => self.notify_error(&error),
        }
    }

    /// Run the error callback with no sampler lock held
    fn notify_error(&self, error: &DeviceError) {
        let taken = self.on_error.lock().take();
        if let Some(mut callback) = taken {
            callback(error);
            let mut slot = self.on_error.lock();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Producer side of the event queue
///
/// `backlog` is a receiver on the same queue, used only to evict the oldest
/// event when an escalation finds the queue full.
struct Events {
    tx: Sender<SamplerEvent>,
    backlog: Receiver<SamplerEvent>,
}

impl Events {
    fn post_sample(&self, sample: Sample) {
        if let Err(TrySendError::Full(event)) = self.tx.try_send(SamplerEvent::Sample(sample)) {
            log::warn!("Event queue full, dropping {:?}", event);
        }
    }

    fn post_error(&self, error: DeviceError) {
        let mut event = SamplerEvent::Error(error);
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if let Ok(evicted) = self.backlog.try_recv() {
                        log::warn!("Event queue full, evicting {:?}", evicted);
                    }
                    event = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Sampler thread body
fn run(
    channel: Arc<Mutex<Option<SharedChannel>>>,
    state: Arc<State>,
    events: Events,
    cancelled: Receiver<()>,
    interval: Duration,
) {
    let mut next = Instant::now();
    loop {
        let wait = next.saturating_duration_since(Instant::now());
        match cancelled.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if !state.running.load(Ordering::Acquire) {
            break;
        }

        let current = channel.lock().clone();
        if let Some(current) = current {
            if !tick(&current, &state, &events) {
                break;
            }
        }

        next += interval;
        let now = Instant::now();
        if next < now {
            let behind = (now - next).as_nanos() / interval.as_nanos();
            let skipped = u32::try_from(behind).unwrap_or(u32::MAX).saturating_add(1);
            log::debug!("Read overran the interval, skipping {} tick(s)", skipped);
            next += interval.saturating_mul(skipped);
        }
    }
    log::debug!("Sampler thread exiting");
}

/// One poll; returns `false` once the failure streak escalates
fn tick(channel: &SharedChannel, state: &State, events: &Events) -> bool {
    let mut channel = channel.lock();
    if !channel.is_open() {
        return true;
    }

    match channel.read() {
        Ok(Some(sample)) => {
            state.errors.store(0, Ordering::Release);
            events.post_sample(sample);
            true
        }
        Ok(None) => {
            log::trace!("No sample this tick");
            true
        }
        Err(e) => {
            let count = state.errors.fetch_add(1, Ordering::AcqRel) + 1;
            log::warn!("Read failed ({}/{}): {}", count, ERROR_THRESHOLD, e);
            if count < ERROR_THRESHOLD {
                return true;
            }

            log::error!(
                "{} consecutive read failures on {}, stopping",
                count,
                channel.description()
            );
            events.post_error(e);
            state.running.store(false, Ordering::Release);
            channel.close();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NullChannel, shared};

    /// Channel whose `open()` always fails
    struct UnpluggedChannel;

    impl Channel for UnpluggedChannel {
        fn open(&mut self) -> DeviceResult<()> {
            Err(DeviceError::open("unplugged"))
        }

        fn close(&mut self) {}

        fn is_open(&self) -> bool {
            false
        }

        fn read(&mut self) -> DeviceResult<Option<Sample>> {
            Err(DeviceError::NotOpen("unplugged".to_string()))
        }

        fn description(&self) -> String {
            "unplugged".to_string()
        }
    }

    #[test]
    fn test_start_without_channel() {
        let sampler = Sampler::new();
        let errors = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&errors);
        sampler.set_on_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(
            sampler.start(Duration::from_millis(10)),
            Err(DeviceError::Config(_))
        ));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!sampler.is_running());
        assert_eq!(sampler.elapsed_ms(), 0);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let sampler = Sampler::new();
        sampler.set_channel(shared(Box::new(NullChannel::new())));
        assert!(sampler.start(Duration::ZERO).is_err());
        assert!(!sampler.is_running());
    }

    #[test]
    fn test_start_opens_and_stop_closes() {
        let channel = shared(Box::new(NullChannel::new()));
        let sampler = Sampler::new();
        sampler.set_channel(Arc::clone(&channel));

        sampler.start(Duration::from_millis(20)).unwrap();
        assert!(sampler.is_running());
        assert!(channel.lock().is_open());

        sampler.stop();
        sampler.stop();
        assert!(!sampler.is_running());
        assert!(!channel.lock().is_open());
    }

    #[test]
    fn test_dispatch_runs_on_caller() {
        let sampler = Sampler::new();
        sampler.set_channel(shared(Box::new(NullChannel::new())));
        let caller = std::thread::current().id();
        let on_caller = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&on_caller);
        sampler.set_on_sample(move |sample| {
            assert!(sample.bt.is_nan());
            flag.store(std::thread::current().id() == caller, Ordering::SeqCst);
        });

        sampler.start(Duration::from_millis(10)).unwrap();
        assert!(sampler.dispatch_timeout(Duration::from_secs(1)) >= 1);
        assert!(on_caller.load(Ordering::SeqCst));
        sampler.stop();
    }

    #[test]
    fn test_error_callback_may_call_sampler() {
        let sampler = Arc::new(Sampler::new());
        sampler.set_channel(shared(Box::new(UnpluggedChannel)));

        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let weak = Arc::downgrade(&sampler);
        sampler.set_on_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            if let Some(sampler) = weak.upgrade() {
                sampler.stop();
                assert!(sampler.start(Duration::from_millis(10)).is_err());
            }
        });

        // A deadlock would leave `start()` blocked forever
        let (done_tx, done_rx) = bounded(1);
        let caller = Arc::clone(&sampler);
        std::thread::spawn(move || {
            let _ = done_tx.send(caller.start(Duration::from_millis(10)).is_err());
        });
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(true));

        // Nested start reports to no callback while the outer one runs
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!sampler.is_running());

        // The callback is still registered afterwards
        assert!(sampler.start(Duration::from_millis(10)).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_can_replace_itself() {
        let sampler = Arc::new(Sampler::new());
        sampler.set_channel(shared(Box::new(UnpluggedChannel)));

        let replaced = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&replaced);
        let weak = Arc::downgrade(&sampler);
        sampler.set_on_error(move |_| {
            let flag = Arc::clone(&flag);
            if let Some(sampler) = weak.upgrade() {
                sampler.set_on_error(move |_| flag.store(true, Ordering::SeqCst));
            }
        });

        assert!(sampler.start(Duration::from_millis(10)).is_err());
        assert!(!replaced.load(Ordering::SeqCst));
        assert!(sampler.start(Duration::from_millis(10)).is_err());
        assert!(replaced.load(Ordering::SeqCst));
    }
}
