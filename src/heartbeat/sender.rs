//! Per-tick heartbeat decision for one connection

use crate::transport::EngineConnection;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Interval at which a connection with the given negotiated heartbeat is checked
///
/// Half the negotiated value, rounded up; `None` when heartbeats are disabled.
pub fn heartbeat_check_interval(heartbeat: u16) -> Option<Duration> {
    (heartbeat > 0).then(|| Duration::from_secs(u64::from(heartbeat).div_ceil(2)))
}

/// What a tick should do for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// Connection is gone; drop its registration
    Unregister,
    /// A frame write is in flight; try again next tick
    SkipWriting,
    /// Traffic is recent enough; nothing to send
    Idle,
    /// Quiet for longer than the interval; send and verify a heartbeat
    CheckHeartbeat,
}

/// Result of a tick as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Keep,
    Unregister,
}

/// What a scheduler holds for one registered connection
///
/// The engine connection is held weakly. The `missed` flag is shared with the
/// owning connection, which treats itself as dead once the flag is raised,
/// whatever the engine reports.
#[derive(Clone)]
pub struct HeartbeatTarget {
    connection: Weak<dyn EngineConnection>,
    missed: Arc<AtomicBool>,
}

impl HeartbeatTarget {
    pub fn new(connection: Weak<dyn EngineConnection>, missed: Arc<AtomicBool>) -> Self {
        Self { connection, missed }
    }

    /// Whether a heartbeat check has failed for this connection
    pub fn has_missed(&self) -> bool {
        self.missed.load(Ordering::SeqCst)
    }

    /// Run one tick; a dropped connection unregisters
    pub async fn beat(&self, interval: Duration) -> TickOutcome {
        match self.connection.upgrade() {
            Some(connection) => {
                HeartbeatSender::tick(connection.as_ref(), &self.missed, interval).await
            }
            None => TickOutcome::Unregister,
        }
    }
}

impl fmt::Debug for HeartbeatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatTarget")
            .field("alive", &(self.connection.strong_count() > 0))
            .field("missed", &self.has_missed())
            .finish()
    }
}

/// Heartbeat transmitter logic shared by every scheduling strategy
pub struct HeartbeatSender;

impl HeartbeatSender {
    /// Pure decision for one tick
    ///
    /// A heartbeat is due only when `now` is strictly later than
    /// `last_activity + interval`.
    pub fn decide(
        connected: bool,
        writing: bool,
        now: DateTime<Utc>,
        last_activity: DateTime<Utc>,
        interval: Duration,
    ) -> TickDecision {
        if !connected {
            return TickDecision::Unregister;
        }
        if writing {
            return TickDecision::SkipWriting;
        }

        // A negative span (clock stepped back) never triggers a check
        match now.signed_duration_since(last_activity).to_std() {
            Ok(quiet) if quiet > interval => TickDecision::CheckHeartbeat,
            _ => TickDecision::Idle,
        }
    }

    /// Run one tick against a live connection
    ///
    /// A failed check raises `missed`, so the owning connection reports itself
    /// dead even when the engine still claims to be connected.
    pub async fn tick(
        connection: &dyn EngineConnection,
        missed: &AtomicBool,
        interval: Duration,
    ) -> TickOutcome {
        let decision = Self::decide(
            connection.is_connected() && !missed.load(Ordering::SeqCst),
            connection.is_writing(),
            Utc::now(),
            connection.last_activity(),
            interval,
        );

        match decision {
            TickDecision::Unregister => {
                debug!("Connection no longer connected, dropping heartbeat registration");
                TickOutcome::Unregister
            }
            TickDecision::SkipWriting => {
                trace!("Write in progress, skipping heartbeat tick");
                TickOutcome::Keep
            }
            TickDecision::Idle => TickOutcome::Keep,
            TickDecision::CheckHeartbeat => match connection.check_heartbeat().await {
                Ok(()) => {
                    trace!("Heartbeat sent");
                    TickOutcome::Keep
                }
                Err(e) => {
                    missed.store(true, Ordering::SeqCst);
                    error!(
                        error_class = e.class_name(),
                        "Missed server heartbeat, connection considered dead: {}", e
                    );
                    TickOutcome::Unregister
                }
            },
        }
    }
}
