//! Credential lifecycle for the Twitch bot
//!
//! Keeps one cached token per credential class (App, User, Chat) and hands
//! out tokens that are never inside their refresh window. Refreshes are
//! serialized per class, mirrored to disk for the refreshable classes, and
//! scheduled ahead of expiry by one monitor task per class.
//!
//! Token lifecycle:
//! 1. Startup seeds the cache from configuration, then `load_persisted()`
//!    replaces it with any record saved by a previous run
//! 2. The monitor's first tick validates seeded tokens or mints new ones
//! 3. Callers use `get_valid_token()`; stale tokens are refreshed inline
//! 4. Later monitor ticks refresh tokens entering their refresh window
//! 5. A failed refresh keeps serving the previous token, flagged `degraded`

pub mod clock;
pub mod error;
pub mod monitor;
pub mod store;
pub mod upstream;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use monitor::{TickOutcome, monitor_tick, spawn_monitor_task};
pub use store::{ClassStatus, CredentialStore, IssuedToken, StatusReport};
pub use upstream::{BoxFuture, TokenUpstream};
