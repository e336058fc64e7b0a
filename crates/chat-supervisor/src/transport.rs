//! Chat transport seam
//!
//! A `ChatTransport` opens one authenticated chat session. The supervisor
//! only sees the resulting `ChatSession`: whether it is alive, a way to send
//! a line, a way to close it, and a signal when it ends.
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn ChatTransport>`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Credentials and target for one login.
#[derive(Clone)]
pub struct ChatLogin {
    pub username: String,
    pub channel: String,
    pub access_token: String,
}

impl std::fmt::Debug for ChatLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatLogin")
            .field("username", &self.username)
            .field("channel", &self.channel)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// A chat line seen in the joined channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub username: String,
    pub text: String,
    pub is_moderator: bool,
    pub is_broadcaster: bool,
}

/// Handle to one live chat session.
///
/// Built by a transport from the session task's channels. Dropping the
/// handle hangs up the same way `close` does.
#[derive(Debug)]
pub struct ChatSession {
    id: Uuid,
    outbound: mpsc::Sender<String>,
    alive: Arc<AtomicBool>,
    closed: watch::Receiver<bool>,
    shutdown: Option<oneshot::Sender<()>>,
}

/// Session-task side of a `ChatSession`.
pub struct SessionTaskEnds {
    pub outbound: mpsc::Receiver<String>,
    pub alive: Arc<AtomicBool>,
    pub closed: watch::Sender<bool>,
    pub shutdown: oneshot::Receiver<()>,
}

impl SessionTaskEnds {
    /// Mark the session dead and wake the close watcher.
    pub fn finish(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.closed.send(true);
    }
}

impl ChatSession {
    /// Create a session handle and the matching task ends.
    pub fn pair() -> (ChatSession, SessionTaskEnds) {
        let (out_tx, out_rx) = mpsc::channel(32);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));
        (
            ChatSession {
                id: Uuid::new_v4(),
                outbound: out_tx,
                alive: alive.clone(),
                closed: closed_rx,
                shutdown: Some(shutdown_tx),
            },
            SessionTaskEnds {
                outbound: out_rx,
                alive,
                closed: closed_tx,
                shutdown: shutdown_rx,
            },
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Queue a chat line for the joined channel.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::NotConnected);
        }
        self.outbound
            .send(text.into())
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Ask the session task to hang up.
    pub fn close(mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Resolves once the session task has finished.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.closed.clone();
        async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens authenticated chat sessions.
pub trait ChatTransport: Send + Sync {
    /// Connect, authenticate and join. Resolves once the server has accepted
    /// the login; the caller applies its own timeout.
    fn connect<'a>(&'a self, login: &'a ChatLogin) -> BoxFuture<'a, Result<ChatSession>>;
}
