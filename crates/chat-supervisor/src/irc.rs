//! Twitch chat over IRC-on-WebSocket
//!
//! Login sequence: `CAP REQ`, `PASS oauth:<token>`, `NICK`, `JOIN`. The
//! server answers `001` on success or a `NOTICE` reading "Login
//! authentication failed" when the token is refused. After login the session
//! task answers `PING` with `PONG`, forwards queued lines as `PRIVMSG`, and
//! publishes incoming `PRIVMSG` lines on a broadcast channel.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::{BoxFuture, ChatLogin, ChatMessage, ChatSession, ChatTransport};

/// Twitch WebSocket IRC server URL
pub const TWITCH_IRC_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

const CAPABILITIES: &str = "CAP REQ :twitch.tv/tags twitch.tv/commands";

/// One parsed server line, as far as the session cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcLine {
    Welcome,
    AuthFailed(String),
    Ping(String),
    Privmsg(ChatMessage),
    Other,
}

/// Classify a single IRC line (no trailing CRLF).
pub fn parse_line(line: &str) -> IrcLine {
    let (tags, rest) = split_tags(line);

    if let Some(payload) = rest.strip_prefix("PING") {
        return IrcLine::Ping(payload.trim().to_owned());
    }

    // :prefix COMMAND params...
    let mut parts = rest.splitn(3, ' ');
    let prefix = parts.next().unwrap_or("");
    let command = parts.next().unwrap_or("");
    let params = parts.next().unwrap_or("");

    match command {
        "001" => IrcLine::Welcome,
        "NOTICE" if params.contains("Login authentication failed")
            || params.contains("Improperly formatted auth") =>
        {
            IrcLine::AuthFailed(trailing(params).to_owned())
        }
        "PRIVMSG" => {
            let login = prefix
                .strip_prefix(':')
                .and_then(|p| p.split('!').next())
                .unwrap_or("unknown");
            let username = tags
                .get("display-name")
                .filter(|n| !n.is_empty())
                .cloned()
                .unwrap_or_else(|| login.to_owned());
            let badges = tags.get("badges").map(String::as_str).unwrap_or("");
            let is_broadcaster = badges.split(',').any(|b| b.starts_with("broadcaster/"));
            let is_moderator = tags.get("mod").is_some_and(|m| m == "1")
                || badges.split(',').any(|b| b.starts_with("moderator/"));
            IrcLine::Privmsg(ChatMessage {
                username,
                text: trailing(params).trim().to_owned(),
                is_moderator,
                is_broadcaster,
            })
        }
        _ => IrcLine::Other,
    }
}

fn split_tags(line: &str) -> (HashMap<String, String>, &str) {
    let mut tags = HashMap::new();
    let Some(tagged) = line.strip_prefix('@') else {
        return (tags, line);
    };
    let Some((tag_str, rest)) = tagged.split_once(' ') else {
        return (tags, "");
    };
    for tag in tag_str.split(';') {
        if let Some((key, value)) = tag.split_once('=') {
            tags.insert(key.to_owned(), value.to_owned());
        }
    }
    (tags, rest)
}

/// The `:trailing` parameter, or the whole string when there is none.
fn trailing(params: &str) -> &str {
    match params.split_once(" :") {
        Some((_, text)) => text,
        None => params.strip_prefix(':').unwrap_or(params),
    }
}

fn normalize_channel(channel: &str) -> String {
    format!("#{}", channel.trim_start_matches('#').to_lowercase())
}

/// Lines sent right after the socket opens.
pub fn login_lines(login: &ChatLogin) -> Vec<String> {
    let token = login
        .access_token
        .strip_prefix("oauth:")
        .unwrap_or(&login.access_token);
    vec![
        CAPABILITIES.to_owned(),
        format!("PASS oauth:{token}"),
        format!("NICK {}", login.username.to_lowercase()),
        format!("JOIN {}", normalize_channel(&login.channel)),
    ]
}

/// Twitch IRC-over-WebSocket transport.
pub struct IrcTransport {
    url: String,
    messages: broadcast::Sender<ChatMessage>,
}

impl IrcTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let (messages, _) = broadcast::channel(256);
        Self {
            url: url.into(),
            messages,
        }
    }

    /// Receive chat lines from every session this transport opens.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatMessage> {
        self.messages.subscribe()
    }
}

impl Default for IrcTransport {
    fn default() -> Self {
        Self::new(TWITCH_IRC_URL)
    }
}

impl ChatTransport for IrcTransport {
    fn connect<'a>(&'a self, login: &'a ChatLogin) -> BoxFuture<'a, Result<ChatSession>> {
        Box::pin(async move {
            debug!(url = %self.url, channel = %login.channel, "opening chat socket");
            let (ws, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| Error::Transport(format!("websocket connect failed: {e}")))?;
            let (mut sink, mut stream) = ws.split();

            for line in login_lines(login) {
                sink.send(Message::Text(line.into()))
                    .await
                    .map_err(|e| Error::Transport(format!("login send failed: {e}")))?;
            }

            // Wait for the server's verdict on the login
            'login: loop {
                let frame = match stream.next().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        return Err(Error::Transport(format!("read during login: {e}")));
                    }
                    None => return Err(Error::Transport("socket closed during login".into())),
                };
                let text = match frame {
                    Message::Text(text) => text,
                    Message::Close(_) => {
                        return Err(Error::Transport("server closed during login".into()));
                    }
                    _ => continue,
                };
                for line in text.as_str().lines() {
                    match parse_line(line.trim_end()) {
                        IrcLine::Welcome => break 'login,
                        IrcLine::AuthFailed(reason) => return Err(Error::Rejected(reason)),
                        IrcLine::Ping(payload) => {
                            sink.send(Message::Text(format!("PONG {payload}").into()))
                                .await
                                .map_err(|e| Error::Transport(format!("pong failed: {e}")))?;
                        }
                        _ => {}
                    }
                }
            }

            let channel = normalize_channel(&login.channel);
            info!(channel = %channel, "chat login accepted");

            let (session, mut ends) = ChatSession::pair();
            let messages = self.messages.clone();
            let session_id = session.id();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = &mut ends.shutdown => {
                            let _ = sink.send(Message::Close(None)).await;
                            debug!(%session_id, "chat session closed locally");
                            break;
                        }
                        Some(text) = ends.outbound.recv() => {
                            let line = format!("PRIVMSG {channel} :{text}");
                            if let Err(e) = sink.send(Message::Text(line.into())).await {
                                warn!(%session_id, error = %e, "chat send failed");
                                break;
                            }
                        }
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                for line in text.as_str().lines() {
                                    match parse_line(line.trim_end()) {
                                        IrcLine::Ping(payload) => {
                                            let pong = Message::Text(format!("PONG {payload}").into());
                                            if let Err(e) = sink.send(pong).await {
                                                warn!(%session_id, error = %e, "pong failed");
                                                ends.finish();
                                                return;
                                            }
                                        }
                                        IrcLine::Privmsg(msg) => {
                                            let _ = messages.send(msg);
                                        }
                                        _ => {}
                                    }
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!(%session_id, ?frame, "chat server closed the session");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(%session_id, error = %e, "chat socket error");
                                break;
                            }
                            None => {
                                info!(%session_id, "chat socket ended");
                                break;
                            }
                        }
                    }
                }
                ends.finish();
            });

            Ok(session)
        })
    }
}
