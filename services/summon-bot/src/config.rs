//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Client secrets, refresh tokens and the error webhook URL are loaded from
//! env vars or `*_file` paths, never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub twitch: TwitchConfig,
    pub bot: BotConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
}

/// Twitch application credentials and identity endpoints
#[derive(Debug, Deserialize)]
pub struct TwitchConfig {
    /// Broadcaster application; mints App tokens and refreshes User tokens
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    /// Bot application for the chat token. Falls back to `client_id`.
    #[serde(default)]
    pub bot_client_id: Option<String>,
    #[serde(skip)]
    pub bot_client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub bot_client_secret_file: Option<PathBuf>,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_validate_url")]
    pub validate_url: String,
    /// Minimum gap between identity requests, across all classes
    #[serde(default = "default_min_request_spacing_ms")]
    pub min_request_spacing_ms: u64,
}

/// Chat identity and reconnect tuning
#[derive(Debug, Deserialize)]
pub struct BotConfig {
    pub username: String,
    pub channel: String,
    #[serde(default = "default_irc_url")]
    pub irc_url: String,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_health_probe")]
    pub health_probe_secs: u64,
}

/// Seed tokens for the refreshable classes. Overridden by whatever a
/// previous run persisted.
#[derive(Debug, Default, Deserialize)]
pub struct TokensConfig {
    #[serde(skip)]
    pub user_access_token: Option<Secret<String>>,
    #[serde(skip)]
    pub user_refresh_token: Option<Secret<String>>,
    #[serde(skip)]
    pub chat_access_token: Option<Secret<String>>,
    #[serde(skip)]
    pub chat_refresh_token: Option<Secret<String>>,
    #[serde(default)]
    pub user_access_token_file: Option<PathBuf>,
    #[serde(default)]
    pub user_refresh_token_file: Option<PathBuf>,
    #[serde(default)]
    pub chat_access_token_file: Option<PathBuf>,
    #[serde(default)]
    pub chat_refresh_token_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `user-token.json` and `chat-token.json`
    #[serde(default = "default_token_dir")]
    pub token_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            token_dir: default_token_dir(),
        }
    }
}

/// Operator HTTP API
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DiscordConfig {
    #[serde(skip)]
    pub error_webhook_url: Option<Secret<String>>,
    #[serde(default)]
    pub error_webhook_url_file: Option<PathBuf>,
}

fn default_token_url() -> String {
    twitch_auth::TOKEN_ENDPOINT.to_owned()
}

fn default_validate_url() -> String {
    twitch_auth::VALIDATE_ENDPOINT.to_owned()
}

fn default_min_request_spacing_ms() -> u64 {
    twitch_auth::MIN_REQUEST_SPACING.as_millis() as u64
}

fn default_irc_url() -> String {
    chat_supervisor::TWITCH_IRC_URL.to_owned()
}

fn default_max_reconnect_attempts() -> u32 {
    chat_supervisor::DEFAULT_MAX_ATTEMPTS
}

fn default_connect_timeout() -> u64 {
    chat_supervisor::CONNECT_TIMEOUT.as_secs()
}

fn default_health_probe() -> u64 {
    chat_supervisor::HEALTH_PROBE_INTERVAL.as_secs()
}

fn default_token_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_max_connections() -> usize {
    256
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Each secret resolves from its env var first, then its `*_file` path.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.validate()?;

        config.twitch.client_secret = resolve_secret(
            "TWITCH_CLIENT_SECRET",
            config.twitch.client_secret_file.as_deref(),
        )?;
        config.twitch.bot_client_secret = resolve_secret(
            "TWITCH_BOT_CLIENT_SECRET",
            config.twitch.bot_client_secret_file.as_deref(),
        )?;

        let tokens = &mut config.tokens;
        tokens.user_access_token = resolve_secret(
            "TWITCH_USER_ACCESS_TOKEN",
            tokens.user_access_token_file.as_deref(),
        )?;
        tokens.user_refresh_token = resolve_secret(
            "TWITCH_USER_REFRESH_TOKEN",
            tokens.user_refresh_token_file.as_deref(),
        )?;
        tokens.chat_access_token = resolve_secret(
            "TWITCH_CHAT_ACCESS_TOKEN",
            tokens.chat_access_token_file.as_deref(),
        )?;
        tokens.chat_refresh_token = resolve_secret(
            "TWITCH_CHAT_REFRESH_TOKEN",
            tokens.chat_refresh_token_file.as_deref(),
        )?;

        config.discord.error_webhook_url = resolve_secret(
            "DISCORD_ERROR_WEBHOOK_URL",
            config.discord.error_webhook_url_file.as_deref(),
        )?;
        if let Some(url) = &config.discord.error_webhook_url
            && !is_http_url(url.expose())
        {
            return Err(common::Error::Config(
                "discord error webhook URL must start with http:// or https://".into(),
            ));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.twitch.client_id.trim().is_empty() {
            return Err(common::Error::Config("twitch.client_id is empty".into()));
        }
        if self.bot.username.trim().is_empty() {
            return Err(common::Error::Config("bot.username is empty".into()));
        }
        if self.bot.channel.trim().trim_start_matches('#').is_empty() {
            return Err(common::Error::Config("bot.channel is empty".into()));
        }
        for (field, url) in [
            ("twitch.token_url", &self.twitch.token_url),
            ("twitch.validate_url", &self.twitch.validate_url),
        ] {
            if !is_http_url(url) {
                return Err(common::Error::Config(format!(
                    "{field} must start with http:// or https://, got: {url}"
                )));
            }
        }
        if !self.bot.irc_url.starts_with("ws://") && !self.bot.irc_url.starts_with("wss://") {
            return Err(common::Error::Config(format!(
                "bot.irc_url must start with ws:// or wss://, got: {}",
                self.bot.irc_url
            )));
        }
        if self.twitch.min_request_spacing_ms < 1000 {
            return Err(common::Error::Config(
                "twitch.min_request_spacing_ms must be at least 1000".into(),
            ));
        }
        if self.bot.max_reconnect_attempts == 0 {
            return Err(common::Error::Config(
                "bot.max_reconnect_attempts must be greater than 0".into(),
            ));
        }
        if self.bot.connect_timeout_secs == 0 || self.bot.health_probe_secs == 0 {
            return Err(common::Error::Config(
                "bot.connect_timeout_secs and bot.health_probe_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "server.max_connections must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn min_request_spacing(&self) -> Duration {
        Duration::from_millis(self.twitch.min_request_spacing_ms)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("summon-bot.toml")
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Env var wins over file. Empty values count as unset; a named file that
/// cannot be read is an error.
fn resolve_secret(env_var: &str, file: Option<&Path>) -> common::Result<Option<Secret<String>>> {
    if let Ok(value) = std::env::var(env_var)
        && let Some(secret) = Secret::from_trimmed(&value)
    {
        return Ok(Some(secret));
    }
    let Some(file) = file else {
        return Ok(None);
    };
    let raw = std::fs::read_to_string(file).map_err(|e| {
        common::Error::Config(format!("failed to read {}: {e}", file.display()))
    })?;
    Ok(Secret::from_trimmed(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const SECRET_VARS: [&str; 7] = [
        "TWITCH_CLIENT_SECRET",
        "TWITCH_BOT_CLIENT_SECRET",
        "TWITCH_USER_ACCESS_TOKEN",
        "TWITCH_USER_REFRESH_TOKEN",
        "TWITCH_CHAT_ACCESS_TOKEN",
        "TWITCH_CHAT_REFRESH_TOKEN",
        "DISCORD_ERROR_WEBHOOK_URL",
    ];

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_secret_env() {
        for var in SECRET_VARS {
            unsafe { remove_env(var) };
        }
    }

    fn valid_toml() -> &'static str {
        r#"
[twitch]
client_id = "broadcaster-app"

[bot]
username = "summonbot"
channel = "streamer"
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("summon-bot.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.twitch.client_id, "broadcaster-app");
        assert_eq!(config.twitch.token_url, "https://id.twitch.tv/oauth2/token");
        assert_eq!(config.min_request_spacing(), Duration::from_secs(1));
        assert_eq!(config.bot.irc_url, "wss://irc-ws.chat.twitch.tv:443");
        assert_eq!(config.bot.max_reconnect_attempts, 5);
        assert_eq!(config.bot.connect_timeout_secs, 15);
        assert_eq!(config.bot.health_probe_secs, 30);
        assert_eq!(config.storage.token_dir, PathBuf::from("data"));
        assert_eq!(config.server.listen_addr.port(), 3000);
        assert!(config.twitch.client_secret.is_none());
        assert!(config.tokens.chat_refresh_token.is_none());
        assert!(config.discord.error_webhook_url.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/summon-bot.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_secrets_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe {
            set_env("TWITCH_CLIENT_SECRET", "app-secret");
            set_env("TWITCH_BOT_CLIENT_SECRET", "bot-secret");
            set_env("TWITCH_USER_REFRESH_TOKEN", "rt_user");
            set_env("TWITCH_CHAT_REFRESH_TOKEN", " rt_chat\n");
            set_env("DISCORD_ERROR_WEBHOOK_URL", "https://discord.test/api/webhooks/1/x");
        }
        let config = Config::load(&path).unwrap();
        clear_secret_env();

        assert_eq!(config.twitch.client_secret.unwrap().expose(), "app-secret");
        assert_eq!(config.twitch.bot_client_secret.unwrap().expose(), "bot-secret");
        assert_eq!(config.tokens.user_refresh_token.unwrap().expose(), "rt_user");
        assert_eq!(config.tokens.chat_refresh_token.unwrap().expose(), "rt_chat");
        assert!(config.discord.error_webhook_url.is_some());
    }

    #[test]
    fn test_secret_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("client_secret");
        std::fs::write(&secret_path, "file-secret\n").unwrap();

        let toml = format!(
            r#"
[twitch]
client_id = "broadcaster-app"
client_secret_file = "{}"

[bot]
username = "summonbot"
channel = "streamer"
"#,
            secret_path.display()
        );
        let path = write_config(&dir, &toml);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.twitch.client_secret.unwrap().expose(), "file-secret");
    }

    #[test]
    fn test_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("chat_refresh");
        std::fs::write(&token_path, "rt_from_file").unwrap();

        let toml = format!(
            r#"
[twitch]
client_id = "broadcaster-app"

[bot]
username = "summonbot"
channel = "streamer"

[tokens]
chat_refresh_token_file = "{}"
"#,
            token_path.display()
        );
        let path = write_config(&dir, &toml);

        unsafe { set_env("TWITCH_CHAT_REFRESH_TOKEN", "rt_from_env") };
        let config = Config::load(&path).unwrap();
        clear_secret_env();

        assert_eq!(
            config.tokens.chat_refresh_token.unwrap().expose(),
            "rt_from_env",
            "env var must take precedence over the file"
        );
    }

    #[test]
    fn test_whitespace_only_secret_file_yields_none() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("bot_secret");
        std::fs::write(&secret_path, "  \n  ").unwrap();

        let toml = format!(
            r#"
[twitch]
client_id = "broadcaster-app"
bot_client_secret_file = "{}"

[bot]
username = "summonbot"
channel = "streamer"
"#,
            secret_path.display()
        );
        let path = write_config(&dir, &toml);

        let config = Config::load(&path).unwrap();
        assert!(config.twitch.bot_client_secret.is_none());
    }

    #[test]
    fn test_missing_secret_file_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[twitch]
client_id = "broadcaster-app"
client_secret_file = "/nonexistent/path/client_secret"

[bot]
username = "summonbot"
channel = "streamer"
"#;
        let path = write_config(&dir, toml);

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("/nonexistent/path/client_secret"), "got: {err}");
    }

    #[test]
    fn test_request_spacing_below_one_second_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[twitch]
client_id = "broadcaster-app"
min_request_spacing_ms = 250

[bot]
username = "summonbot"
channel = "streamer"
"#;
        let path = write_config(&dir, toml);

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("min_request_spacing_ms"), "got: {err}");
    }

    #[test]
    fn test_invalid_urls_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();

        let bad_token_url = r#"
[twitch]
client_id = "broadcaster-app"
token_url = "id.twitch.tv/oauth2/token"

[bot]
username = "summonbot"
channel = "streamer"
"#;
        let path = write_config(&dir, bad_token_url);
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("twitch.token_url must start with http"), "got: {err}");

        let bad_irc_url = r#"
[twitch]
client_id = "broadcaster-app"

[bot]
username = "summonbot"
channel = "streamer"
irc_url = "https://irc-ws.chat.twitch.tv"
"#;
        let path = write_config(&dir, bad_irc_url);
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("bot.irc_url"), "got: {err}");
    }

    #[test]
    fn test_empty_channel_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let toml = r##"
[twitch]
client_id = "broadcaster-app"

[bot]
username = "summonbot"
channel = "#"
"##;
        let path = write_config(&dir, toml);
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_zero_max_reconnect_attempts_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[twitch]
client_id = "broadcaster-app"

[bot]
username = "summonbot"
channel = "streamer"
max_reconnect_attempts = 0
"#;
        let path = write_config(&dir, toml);
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("summon-bot.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }
}
