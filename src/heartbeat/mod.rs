//! Client-side heartbeat subsystem
//!
//! Connections with a negotiated heartbeat register with a
//! [`HeartbeatScheduler`]; the scheduler runs [`HeartbeatSender`] ticks in
//! background tokio tasks until the connection unregisters or is found dead.

pub mod scheduler;
pub mod sender;

pub use scheduler::{
    scheduler_for, ConnectionId, EventLoopScheduler, HeartbeatScheduler, NullScheduler,
    PeriodicScheduler,
};
pub use sender::{
    heartbeat_check_interval, HeartbeatSender, HeartbeatTarget, TickDecision, TickOutcome,
};
