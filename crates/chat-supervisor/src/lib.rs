//! Chat connection resilience
//!
//! Keeps the bot joined to its Twitch channel. A single driver task owns
//! the connection state machine (`machine`), backs off between failed
//! attempts (`backoff`), and raises one critical notification per outage
//! once the retry budget is spent. The transport is a seam: `IrcTransport`
//! speaks Twitch IRC over WebSocket, tests plug in fakes.

pub mod backoff;
pub mod error;
pub mod health;
pub mod irc;
pub mod machine;
pub mod supervisor;
pub mod transport;

pub use backoff::{BackoffPolicy, DEFAULT_MAX_ATTEMPTS, RetryBudget};
pub use error::{Error, Result};
pub use health::{HEALTH_PROBE_INTERVAL, spawn_health_probe};
pub use irc::{IrcTransport, TWITCH_IRC_URL};
pub use machine::{
    ConnectionState, SupervisorAction, SupervisorEvent, SupervisorState, handle_event,
};
pub use supervisor::{
    CONNECT_TIMEOUT, ChatStatus, ChatTokenSource, ConnectionSupervisor, SupervisorConfig,
    SupervisorHandle,
};
pub use transport::{
    BoxFuture, ChatLogin, ChatMessage, ChatSession, ChatTransport, SessionTaskEnds,
};
