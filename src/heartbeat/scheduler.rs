//! Heartbeat scheduling strategies
//!
//! A scheduler owns the registry of connections that need client-side
//! heartbeats and decides when [`HeartbeatTarget::beat`] runs for each of them.
//! Registrations hold only a `Weak` reference, so a dropped connection
//! never stays alive because of its heartbeat, and is swept on the next tick.
//! A failed check raises the registration's missed flag before it is swept.
//!
//! The registry lock is a `parking_lot` mutex that is never held across an
//! await. `unregister` is idempotent and may be called from inside a tick.

use super::sender::{HeartbeatTarget, TickOutcome};
use crate::config::HeartbeatSchedulerKind;
use crate::heartbeat_span;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

/// Identity of a registered connection
pub type ConnectionId = Uuid;

/// Registry of connections needing heartbeats
pub trait HeartbeatScheduler: Send + Sync + fmt::Debug {
    /// Start heartbeats for a connection at the given check interval
    ///
    /// Registering an id again replaces the earlier registration.
    fn register(&self, id: ConnectionId, target: HeartbeatTarget, interval: Duration);

    /// Stop heartbeats for a connection; unknown ids are ignored
    fn unregister(&self, id: ConnectionId);

    fn is_registered(&self, id: ConnectionId) -> bool;
}

/// Build the scheduler for a configured strategy
pub fn scheduler_for(kind: HeartbeatSchedulerKind) -> Arc<dyn HeartbeatScheduler> {
    match kind {
        HeartbeatSchedulerKind::Periodic => Arc::new(PeriodicScheduler::new()),
        HeartbeatSchedulerKind::EventLoop => Arc::new(EventLoopScheduler::new()),
        HeartbeatSchedulerKind::Disabled => Arc::new(NullScheduler),
    }
}

fn current_runtime() -> Option<Handle> {
    match Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(_) => {
            warn!("No tokio runtime available, heartbeats will not be sent");
            None
        }
    }
}

struct Registration {
    target: HeartbeatTarget,
    interval: Duration,
}

struct Ticker {
    period: Duration,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PeriodicState {
    registrations: HashMap<ConnectionId, Registration>,
    ticker: Option<Ticker>,
}

#[derive(Default)]
struct PeriodicInner {
    state: Mutex<PeriodicState>,
}

/// One shared background task firing at the coarsest registered interval
///
/// The task is re-armed whenever the coarsest interval changes and aborted as
/// soon as the last connection unregisters.
#[derive(Default)]
pub struct PeriodicScheduler {
    inner: Arc<PeriodicInner>,
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a background ticker is currently running
    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().ticker.is_some()
    }

    /// Period of the running ticker
    pub fn period(&self) -> Option<Duration> {
        self.inner.state.lock().ticker.as_ref().map(|t| t.period)
    }
}

impl PeriodicInner {
    fn rearm(self: &Arc<Self>, state: &mut PeriodicState) {
        let Some(period) = state.registrations.values().map(|r| r.interval).max() else {
            if let Some(ticker) = state.ticker.take() {
                ticker.handle.abort();
                debug!("Last heartbeat registration removed, ticker stopped");
            }
            return;
        };

        if state.ticker.as_ref().is_some_and(|t| t.period == period) {
            return;
        }

        if let Some(old) = state.ticker.take() {
            old.handle.abort();
        }
        state.ticker = Self::spawn_ticker(Arc::downgrade(self), period)
            .map(|handle| Ticker { period, handle });
    }

    fn spawn_ticker(inner: Weak<Self>, period: Duration) -> Option<JoinHandle<()>> {
        let runtime = current_runtime()?;
        debug!("Heartbeat ticker armed every {:?}", period);

        let span = heartbeat_span!(strategy = "periodic", period_ms = period.as_millis() as u64);
        Some(runtime.spawn(
            async move {
                loop {
                    tokio::time::sleep(period).await;
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    inner.fire().await;
                }
            }
            .instrument(span),
        ))
    }

    async fn fire(self: &Arc<Self>) {
        let due: Vec<(ConnectionId, HeartbeatTarget, Duration)> = {
            let state = self.state.lock();
            state
                .registrations
                .iter()
                .map(|(id, r)| (*id, r.target.clone(), r.interval))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, target, interval) in due {
            if target.beat(interval).await == TickOutcome::Unregister {
                dead.push(id);
            }
        }

        // Unregistering may abort this very task, so it happens after the sweep
        for id in dead {
            self.unregister(id);
        }
    }

    fn unregister(self: &Arc<Self>, id: ConnectionId) {
        let mut state = self.state.lock();
        if state.registrations.remove(&id).is_some() {
            debug!("Heartbeat unregistered for connection {}", id);
            self.rearm(&mut state);
        }
    }
}

impl Drop for PeriodicInner {
    fn drop(&mut self) {
        if let Some(ticker) = self.state.get_mut().ticker.take() {
            ticker.handle.abort();
        }
    }
}

impl HeartbeatScheduler for PeriodicScheduler {
    fn register(&self, id: ConnectionId, target: HeartbeatTarget, interval: Duration) {
        let mut state = self.inner.state.lock();
        state
            .registrations
            .insert(id, Registration { target, interval });
        debug!("Heartbeat registered for connection {} every {:?}", id, interval);
        self.inner.rearm(&mut state);
    }

    fn unregister(&self, id: ConnectionId) {
        self.inner.unregister(id);
    }

    fn is_registered(&self, id: ConnectionId) -> bool {
        self.inner.state.lock().registrations.contains_key(&id)
    }
}

impl fmt::Debug for PeriodicScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PeriodicScheduler")
            .field("registrations", &state.registrations.len())
            .field("period", &state.ticker.as_ref().map(|t| t.period))
            .finish()
    }
}

type TaskMap = HashMap<ConnectionId, (u64, JoinHandle<()>)>;

/// One timer task per connection at that connection's own interval
#[derive(Default)]
pub struct EventLoopScheduler {
    tasks: Arc<Mutex<TaskMap>>,
    generation: Mutex<u64>,
}

impl EventLoopScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_generation(&self) -> u64 {
        let mut generation = self.generation.lock();
        *generation += 1;
        *generation
    }
}

impl HeartbeatScheduler for EventLoopScheduler {
    fn register(&self, id: ConnectionId, target: HeartbeatTarget, interval: Duration) {
        let Some(runtime) = current_runtime() else {
            return;
        };

        let generation = self.next_generation();
        let tasks = Arc::downgrade(&self.tasks);
        let span = heartbeat_span!(strategy = "event_loop", connection_id = %id);

        // The lock is held over the spawn so a fast-exiting task cannot remove
        // its entry before it is inserted
        let mut map = self.tasks.lock();
        let handle = runtime.spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if target.beat(interval).await == TickOutcome::Unregister {
                        break;
                    }
                }

                if let Some(tasks) = tasks.upgrade() {
                    let mut map = tasks.lock();
                    if map.get(&id).is_some_and(|(g, _)| *g == generation) {
                        map.remove(&id);
                        debug!("Heartbeat task for connection {} finished", id);
                    }
                }
            }
            .instrument(span),
        );

        if let Some((_, previous)) = map.insert(id, (generation, handle)) {
            previous.abort();
        }
        debug!("Heartbeat registered for connection {} every {:?}", id, interval);
    }

    fn unregister(&self, id: ConnectionId) {
        if let Some((_, handle)) = self.tasks.lock().remove(&id) {
            handle.abort();
            debug!("Heartbeat unregistered for connection {}", id);
        }
    }

    fn is_registered(&self, id: ConnectionId) -> bool {
        self.tasks.lock().contains_key(&id)
    }
}

impl Drop for EventLoopScheduler {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

impl fmt::Debug for EventLoopScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopScheduler")
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

/// Scheduler that never sends heartbeats
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScheduler;

impl HeartbeatScheduler for NullScheduler {
    fn register(&self, id: ConnectionId, _target: HeartbeatTarget, _interval: Duration) {
        debug!("Heartbeats disabled, connection {} not registered", id);
    }

    fn unregister(&self, _id: ConnectionId) {}

    fn is_registered(&self, _id: ConnectionId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEngineConnection;
    use crate::transport::EngineConnection;
    use std::sync::atomic::AtomicBool;

    fn stale_connection(heartbeat: u16) -> Arc<MockEngineConnection> {
        let connection = Arc::new(MockEngineConnection::new(heartbeat));
        connection.set_last_activity(chrono::Utc::now() - chrono::Duration::hours(1));
        connection
    }

    fn target_of(connection: &Arc<MockEngineConnection>) -> HeartbeatTarget {
        let connection: Arc<dyn EngineConnection> = connection.clone();
        HeartbeatTarget::new(Arc::downgrade(&connection), Arc::new(AtomicBool::new(false)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_uses_coarsest_interval() {
        let scheduler = PeriodicScheduler::new();
        let fast = stale_connection(2);
        let slow = stale_connection(10);
        let (fast_id, slow_id) = (Uuid::new_v4(), Uuid::new_v4());

        scheduler.register(fast_id, target_of(&fast), Duration::from_secs(1));
        assert_eq!(scheduler.period(), Some(Duration::from_secs(1)));

        scheduler.register(slow_id, target_of(&slow), Duration::from_secs(5));
        assert_eq!(scheduler.period(), Some(Duration::from_secs(5)));

        scheduler.unregister(slow_id);
        assert_eq!(scheduler.period(), Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_fires_and_stops_when_empty() {
        let scheduler = PeriodicScheduler::new();
        let connection = stale_connection(2);
        let id = Uuid::new_v4();

        scheduler.register(id, target_of(&connection), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(connection.heartbeat_checks(), 3);

        scheduler.unregister(id);
        scheduler.unregister(id);
        assert!(!scheduler.is_armed());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connection.heartbeat_checks(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_connection_is_swept() {
        let scheduler = PeriodicScheduler::new();
        let connection = stale_connection(2);
        let id = Uuid::new_v4();

        scheduler.register(id, target_of(&connection), Duration::from_secs(1));
        connection.set_connected(false);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!scheduler.is_registered(id));
        assert!(!scheduler.is_armed());
        assert_eq!(connection.heartbeat_checks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_connection_is_swept() {
        let scheduler = PeriodicScheduler::new();
        let connection = stale_connection(2);
        let id = Uuid::new_v4();

        scheduler.register(id, target_of(&connection), Duration::from_secs(1));
        drop(connection);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!scheduler.is_registered(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_uses_own_interval() {
        let scheduler = EventLoopScheduler::new();
        let fast = stale_connection(2);
        let slow = stale_connection(10);

        scheduler.register(Uuid::new_v4(), target_of(&fast), Duration::from_secs(1));
        scheduler.register(Uuid::new_v4(), target_of(&slow), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(5500)).await;

        assert_eq!(fast.heartbeat_checks(), 5);
        assert_eq!(slow.heartbeat_checks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_unregister_from_missed_heartbeat() {
        let scheduler = EventLoopScheduler::new();
        let connection = stale_connection(2);
        connection.fail_heartbeats();
        let id = Uuid::new_v4();

        scheduler.register(id, target_of(&connection), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!scheduler.is_registered(id));
        scheduler.unregister(id);
    }

    #[tokio::test]
    async fn test_null_scheduler_never_registers() {
        let scheduler = scheduler_for(HeartbeatSchedulerKind::Disabled);
        let connection = stale_connection(2);
        let id = Uuid::new_v4();

        scheduler.register(id, target_of(&connection), Duration::from_secs(1));
        assert!(!scheduler.is_registered(id));
        scheduler.unregister(id);
    }

    #[test]
    fn test_register_without_runtime_keeps_registry() {
        let scheduler = PeriodicScheduler::new();
        let connection = stale_connection(2);
        let id = Uuid::new_v4();

        scheduler.register(id, target_of(&connection), Duration::from_secs(1));
        assert!(scheduler.is_registered(id));
        assert!(!scheduler.is_armed());
    }
}
