//! Types shared by every crate in the summon-bot workspace

mod error;
pub mod notify;
mod secret;

pub use error::{Error, Result};
pub use notify::{LogSink, Notification, NotificationSink, Severity};
pub use secret::Secret;
