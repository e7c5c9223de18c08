//! Cooperative event scheduler.
//!
//! A dedicated thread ticks at a fixed interval after a warm-up delay. Each
//! tick evaluates the registered events in registration order and dispatches
//! the due ones onto the runtime's blocking pool. An event is due when its
//! condition (required for triggers, optional for timers) holds and its
//! throttling interval has elapsed since the last dispatch.
//!
//! Lifecycle: `Uninitiated -> BeginInitial -> Initialized -> BeginTeardown -> Dead`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitiated,
    BeginInitial,
    Initialized,
    BeginTeardown,
    Dead,
}

/// Scheduler timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Delay before the first tick (default: 1s)
    #[serde(default = "default_warmup")]
    pub warmup_ms: u64,

    /// Sleep between ticks (default: 200ms)
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
}

fn default_warmup() -> u64 {
    1_000
}

fn default_tick() -> u64 {
    200
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            warmup_ms: default_warmup(),
            tick_ms: default_tick(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Trigger event '{0}' has no condition")]
    MissingCondition(String),

    #[error("Scheduler has already been torn down")]
    AlreadyTornDown,

    #[error("Failed to start scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Fires on its interval; condition optional
    Timer,

    /// Fires when its condition holds; condition required
    Trigger,
}

pub type Condition = Arc<dyn Fn() -> bool + Send + Sync>;
pub type EventBlock = Arc<dyn Fn() + Send + Sync>;
pub type LifecycleListener = Arc<dyn Fn(LifecycleState) + Send + Sync>;

/// A registered timer or trigger
#[derive(Clone)]
pub struct ScheduledEvent {
    pub label: String,
    pub kind: EventKind,
    pub condition: Option<Condition>,
    pub throttling_interval: Duration,
    pub block: EventBlock,
    last_execute: Option<Instant>,
}

impl std::fmt::Debug for ScheduledEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledEvent")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("has_condition", &self.condition.is_some())
            .field("throttling_interval", &self.throttling_interval)
            .field("last_execute", &self.last_execute)
            .finish()
    }
}

impl ScheduledEvent {
    pub fn timer(
        label: impl Into<String>,
        interval: Duration,
        block: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            kind: EventKind::Timer,
            condition: None,
            throttling_interval: interval,
            block: Arc::new(block),
            last_execute: None,
        }
    }

    pub fn trigger(
        label: impl Into<String>,
        throttling_interval: Duration,
        condition: impl Fn() -> bool + Send + Sync + 'static,
        block: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: EventKind::Trigger,
            condition: Some(Arc::new(condition)),
            ..Self::timer(label, throttling_interval, block)
        }
    }

    pub fn with_condition(mut self, condition: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn last_execute(&self) -> Option<Instant> {
        self.last_execute
    }

    fn throttle_open(&self, now: Instant) -> bool {
        match self.last_execute {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.throttling_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    priority: i32,
    callback: LifecycleListener,
}

struct SchedulerInner {
    settings: SchedulerSettings,
    handle: Handle,
    state: Mutex<LifecycleState>,
    events: Mutex<Vec<(EventId, ScheduledEvent)>>,
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
}

/// Stop signal and join handle of the tick thread
struct LoopWorker {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Tick-driven dispatcher for timers and triggers
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    worker: Mutex<Option<LoopWorker>>,
    /// Held for a whole `initialize` or `teardown`
    lifecycle: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Scheduler {
    /// Blocks run on `handle`'s blocking pool
    pub fn new(settings: SchedulerSettings, handle: Handle) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                settings,
                handle,
                state: Mutex::new(LifecycleState::Uninitiated),
                events: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
            worker: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.inner.state)
    }

    /// Register an event; triggers must carry a condition
    pub fn register(&self, event: ScheduledEvent) -> Result<EventId, SchedulerError> {
        if event.kind == EventKind::Trigger && event.condition.is_none() {
            return Err(SchedulerError::MissingCondition(event.label));
        }

        let id = EventId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(label = %event.label, kind = ?event.kind, "Registered event");
        lock(&self.inner.events).push((id, event));
        Ok(id)
    }

    /// Returns `false` if the event was not registered
    pub fn remove(&self, id: EventId) -> bool {
        let mut events = lock(&self.inner.events);
        let before = events.len();
        events.retain(|(event_id, _)| *event_id != id);
        events.len() != before
    }

    pub fn event_count(&self) -> usize {
        lock(&self.inner.events).len()
    }

    /// Listen for lifecycle changes; higher priority is notified first
    pub fn on_lifecycle_change(
        &self,
        priority: i32,
        callback: impl Fn(LifecycleState) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = lock(&self.inner.listeners);
        listeners.push(Listener {
            id,
            priority,
            callback: Arc::new(callback),
        });
        // Stable: equal priorities keep registration order.
        listeners.sort_by(|a, b| b.priority.cmp(&a.priority));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Start the tick thread.
    ///
    /// A second call while running only warns. Listeners must not call back
    /// into `initialize` or `teardown`.
    pub fn initialize(&self) -> Result<(), SchedulerError> {
        let _lifecycle = lock(&self.lifecycle);
        {
            let mut state = lock(&self.inner.state);
            match *state {
                LifecycleState::Uninitiated => *state = LifecycleState::BeginInitial,
                LifecycleState::BeginInitial | LifecycleState::Initialized => {
                    warn!("Scheduler already initialized");
                    return Ok(());
                }
                LifecycleState::BeginTeardown | LifecycleState::Dead => {
                    return Err(SchedulerError::AlreadyTornDown);
                }
            }
        }
        self.inner.notify(LifecycleState::BeginInitial);

        let (stop, stop_rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let thread = std::thread::Builder::new()
            .name("stepwise-scheduler".to_string())
            .spawn(move || inner.run_loop(stop_rx))?;
        *lock(&self.worker) = Some(LoopWorker { stop, thread });

        self.inner.transition(LifecycleState::Initialized);
        info!(
            warmup_ms = self.inner.settings.warmup_ms,
            tick_ms = self.inner.settings.tick_ms,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stop the tick thread and wait for it to exit.
    ///
    /// One-shot: a second call returns `AlreadyTornDown`. Waits for an
    /// `initialize` in progress to finish first.
    pub fn teardown(&self) -> Result<(), SchedulerError> {
        let _lifecycle = lock(&self.lifecycle);
        {
            let mut state = lock(&self.inner.state);
            match *state {
                LifecycleState::BeginTeardown | LifecycleState::Dead => {
                    return Err(SchedulerError::AlreadyTornDown);
                }
                _ => *state = LifecycleState::BeginTeardown,
            }
        }
        self.inner.notify(LifecycleState::BeginTeardown);

        if let Some(worker) = lock(&self.worker).take() {
            // The loop may already be gone; a failed send is fine.
            let _ = worker.stop.send(());
            if worker.thread.join().is_err() {
                error!("Scheduler thread panicked");
            }
        }

        self.inner.transition(LifecycleState::Dead);
        info!("Scheduler stopped");
        Ok(())
    }

    /// Evaluate every event once at `now`; returns how many were dispatched
    pub fn tick(&self, now: Instant) -> usize {
        self.inner.tick(now)
    }
}

impl SchedulerInner {
    fn transition(&self, next: LifecycleState) {
        *lock(&self.state) = next;
        self.notify(next);
    }

    fn notify(&self, state: LifecycleState) {
        let callbacks: Vec<LifecycleListener> = lock(&self.listeners)
            .iter()
            .map(|l| Arc::clone(&l.callback))
            .collect();
        for callback in callbacks {
            callback(state);
        }
    }

    fn run_loop(&self, stop: mpsc::Receiver<()>) {
        let warmup = Duration::from_millis(self.settings.warmup_ms);
        let tick = Duration::from_millis(self.settings.tick_ms);

        if !matches!(stop.recv_timeout(warmup), Err(RecvTimeoutError::Timeout)) {
            return;
        }

        loop {
            self.tick(Instant::now());
            match stop.recv_timeout(tick) {
                Err(RecvTimeoutError::Timeout) => continue,
                // Stop requested or the scheduler was dropped.
                _ => break,
            }
        }
        debug!("Scheduler loop exited");
    }

    fn tick(&self, now: Instant) -> usize {
        // Throttle check on a snapshot; conditions run without the lock.
        let candidates: Vec<(EventId, Option<Condition>)> = lock(&self.events)
            .iter()
            .filter(|(_, event)| event.throttle_open(now))
            .map(|(id, event)| (*id, event.condition.clone()))
            .collect();

        let ready: Vec<EventId> = candidates
            .into_iter()
            .filter(|(_, condition)| condition.as_ref().map_or(true, |c| c()))
            .map(|(id, _)| id)
            .collect();

        if ready.is_empty() {
            return 0;
        }

        let due: Vec<(String, EventBlock)> = {
            let mut events = lock(&self.events);
            events
                .iter_mut()
                .filter(|(id, event)| ready.contains(id) && event.throttle_open(now))
                .map(|(_, event)| {
                    event.last_execute = Some(now);
                    (event.label.clone(), Arc::clone(&event.block))
                })
                .collect()
        };

        let dispatched = due.len();
        for (label, block) in due {
            debug!(%label, "Dispatching event");
            self.handle.spawn_blocking(move || block());
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn fast() -> SchedulerSettings {
        SchedulerSettings {
            warmup_ms: 10,
            tick_ms: 10,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_throttle_limits_fire_rate() {
        let scheduler = Scheduler::new(fast(), Handle::current());
        let (count, block) = counter();
        scheduler
            .register(ScheduledEvent::timer("every-second", Duration::from_secs(1), block))
            .unwrap();

        let base = Instant::now();
        let mut dispatched = 0;
        for ms in (0..=2_400).step_by(200) {
            dispatched += scheduler.tick(base + Duration::from_millis(ms));
        }

        // Fires at 0, 1000 and 2000ms.
        assert_eq!(dispatched, 3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_trigger_requires_condition() {
        let scheduler = Scheduler::new(fast(), Handle::current());
        let event = ScheduledEvent {
            kind: EventKind::Trigger,
            ..ScheduledEvent::timer("bare", Duration::ZERO, || {})
        };

        assert!(matches!(
            scheduler.register(event),
            Err(SchedulerError::MissingCondition(label)) if label == "bare"
        ));
        assert_eq!(scheduler.event_count(), 0);
    }

    #[tokio::test]
    async fn test_trigger_fires_only_when_condition_holds() {
        let scheduler = Scheduler::new(fast(), Handle::current());
        let armed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&armed);
        let (count, block) = counter();
        scheduler
            .register(ScheduledEvent::trigger(
                "armed",
                Duration::ZERO,
                move || flag.load(Ordering::SeqCst),
                block,
            ))
            .unwrap();

        let now = Instant::now();
        assert_eq!(scheduler.tick(now), 0);
        armed.store(true, Ordering::SeqCst);
        assert_eq!(scheduler.tick(now + Duration::from_millis(200)), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timer_condition_gates_dispatch() {
        let scheduler = Scheduler::new(fast(), Handle::current());
        let open = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&open);
        let (count, block) = counter();
        scheduler
            .register(
                ScheduledEvent::timer("gated", Duration::from_secs(1), block)
                    .with_condition(move || flag.load(Ordering::SeqCst)),
            )
            .unwrap();

        let base = Instant::now();
        assert_eq!(scheduler.tick(base), 0);
        assert_eq!(scheduler.tick(base + Duration::from_millis(1_500)), 0);

        open.store(true, Ordering::SeqCst);
        assert_eq!(scheduler.tick(base + Duration::from_millis(1_700)), 1);
        // Throttled after firing, even with the condition true.
        assert_eq!(scheduler.tick(base + Duration::from_millis(2_000)), 0);
        assert_eq!(scheduler.tick(base + Duration::from_millis(2_700)), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_removed_event_no_longer_fires() {
        let scheduler = Scheduler::new(fast(), Handle::current());
        let (_, block) = counter();
        let id = scheduler
            .register(ScheduledEvent::timer("gone", Duration::ZERO, block))
            .unwrap();

        assert!(scheduler.remove(id));
        assert!(!scheduler.remove(id));
        assert_eq!(scheduler.tick(Instant::now()), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lifecycle_notifies_by_priority() {
        let scheduler = Scheduler::new(fast(), Handle::current());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for priority in [1, 10, 5] {
            let seen = Arc::clone(&seen);
            scheduler.on_lifecycle_change(priority, move |state| {
                seen.lock().unwrap().push((priority, state));
            });
        }
        let dropped = scheduler.on_lifecycle_change(100, |_| panic!("removed listener called"));
        assert!(scheduler.remove_listener(dropped));

        scheduler.initialize().unwrap();
        assert_eq!(scheduler.state(), LifecycleState::Initialized);
        scheduler.initialize().unwrap();

        scheduler.teardown().unwrap();
        assert_eq!(scheduler.state(), LifecycleState::Dead);

        let seen = seen.lock().unwrap();
        let expected: Vec<(i32, LifecycleState)> = [
            LifecycleState::BeginInitial,
            LifecycleState::Initialized,
            LifecycleState::BeginTeardown,
            LifecycleState::Dead,
        ]
        .into_iter()
        .flat_map(|state| [(10, state), (5, state), (1, state)])
        .collect();
        assert_eq!(*seen, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_loop_dispatches_and_teardown_is_one_shot() {
        let scheduler = Scheduler::new(fast(), Handle::current());
        let (count, block) = counter();
        scheduler
            .register(ScheduledEvent::timer("busy", Duration::ZERO, block))
            .unwrap();

        scheduler.initialize().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.teardown().unwrap();

        assert!(count.load(Ordering::SeqCst) > 0);
        assert!(matches!(
            scheduler.teardown(),
            Err(SchedulerError::AlreadyTornDown)
        ));
        assert!(matches!(
            scheduler.initialize(),
            Err(SchedulerError::AlreadyTornDown)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_teardown_waits_for_initialize() {
        let scheduler = Arc::new(Scheduler::new(fast(), Handle::current()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stopper = Arc::new(Mutex::new(None));

        {
            let seen = Arc::clone(&seen);
            let stopper = Arc::clone(&stopper);
            let weak = Arc::downgrade(&scheduler);
            scheduler.on_lifecycle_change(0, move |state| {
                seen.lock().unwrap().push(state);
                if state != LifecycleState::BeginInitial {
                    return;
                }
                // Teardown races the rest of initialize.
                let weak = weak.clone();
                *stopper.lock().unwrap() = Some(std::thread::spawn(move || {
                    weak.upgrade().map(|scheduler| scheduler.teardown())
                }));
                std::thread::sleep(Duration::from_millis(50));
            });
        }

        scheduler.initialize().unwrap();
        let handle = stopper.lock().unwrap().take().unwrap();
        assert!(matches!(handle.join().unwrap(), Some(Ok(()))));

        assert_eq!(scheduler.state(), LifecycleState::Dead);
        assert!(lock(&scheduler.worker).is_none());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                LifecycleState::BeginInitial,
                LifecycleState::Initialized,
                LifecycleState::BeginTeardown,
                LifecycleState::Dead,
            ]
        );
    }

    #[tokio::test]
    async fn test_teardown_before_initialize() {
        let scheduler = Scheduler::new(fast(), Handle::current());
        scheduler.teardown().unwrap();
        assert_eq!(scheduler.state(), LifecycleState::Dead);
    }
}
