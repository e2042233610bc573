#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{debug, info, warn};
use transmuter_platform::SecretString;
use transmuter_platform::discord::{DEFAULT_API_BASE_URL, DEFAULT_GATEWAY_URL, DEFAULT_INTENTS};

pub const DEFAULT_BIND: &str = "http://0.0.0.0:3000";
pub const DEFAULT_WEBHOOK_NAME: &str = "Transmuter";

/// Default config path: `~/.transmuter/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".transmuter").join("config.toml"))
}

/// Load the config from `path` (missing file means defaults), then apply env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	normalize(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub hub: HubSettings,
	pub discord: DiscordSettings,
}

/// HTTP front end and socket settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Listen address (`http://host:port`); the `--bind` flag wins over this.
	pub bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Value of `Access-Control-Allow-Origin` on every response.
	pub allow_origin: String,
	/// Outbound queue depth per socket before the hub evicts it.
	pub connection_queue_capacity: usize,
	pub keepalive_interval: Duration,
	pub idle_timeout: Duration,
	/// Largest client frame accepted on a socket.
	pub max_frame_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
	pub command_capacity: usize,
	/// Pending socket-to-channel posts per channel before new ones are dropped.
	pub webhook_queue_capacity: usize,
	pub debug_logs: bool,
}

#[derive(Debug, Clone)]
pub struct DiscordSettings {
	pub bot_token: Option<SecretString>,
	pub api_base_url: String,
	pub gateway_url: String,
	pub intents: u64,
	/// Display name of the webhook created on channels that have none.
	pub webhook_name: String,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	hub: FileHubSettings,

	#[serde(default)]
	discord: FileDiscordSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	allow_origin: Option<String>,
	connection_queue_capacity: Option<usize>,
	keepalive_interval_secs: Option<u64>,
	idle_timeout_secs: Option<u64>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHubSettings {
	command_capacity: Option<usize>,
	webhook_queue_capacity: Option<usize>,
	debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDiscordSettings {
	bot_token: Option<String>,
	api_base_url: Option<String>,
	gateway_url: Option<String>,
	intents: Option<u64>,
	webhook_name: Option<String>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				bind: non_empty(file.server.bind),
				metrics_bind: non_empty(file.server.metrics_bind),
				allow_origin: non_empty(file.server.allow_origin).unwrap_or_else(|| "*".to_string()),
				connection_queue_capacity: file.server.connection_queue_capacity.unwrap_or(256),
				keepalive_interval: Duration::from_secs(file.server.keepalive_interval_secs.unwrap_or(30)),
				idle_timeout: Duration::from_secs(file.server.idle_timeout_secs.unwrap_or(90)),
				max_frame_bytes: file.server.max_frame_bytes.unwrap_or(64 * 1024),
			},
			hub: HubSettings {
				command_capacity: file.hub.command_capacity.unwrap_or(1024),
				webhook_queue_capacity: file.hub.webhook_queue_capacity.unwrap_or(256),
				debug_logs: file.hub.debug_logs.unwrap_or(false),
			},
			discord: DiscordSettings {
				bot_token: non_empty(file.discord.bot_token).map(SecretString::new),
				api_base_url: non_empty(file.discord.api_base_url).unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
				gateway_url: non_empty(file.discord.gateway_url).unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
				intents: file.discord.intents.unwrap_or(DEFAULT_INTENTS),
				webhook_name: non_empty(file.discord.webhook_name).unwrap_or_else(|| DEFAULT_WEBHOOK_NAME.to_string()),
				reconnect_min_delay: Duration::from_millis(file.discord.reconnect_min_delay_ms.unwrap_or(500)),
				reconnect_max_delay: Duration::from_millis(file.discord.reconnect_max_delay_ms.unwrap_or(30_000)),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
	non_empty(get(key))
}

fn env_parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
	let raw = env_string(get, key)?;
	match raw.parse::<T>() {
		Ok(v) => Some(v),
		Err(_) => {
			warn!(key, value = %raw, "ignoring unparsable env override");
			None
		}
	}
}

/// Apply `TRANSMUTER_*` overrides (plus the legacy `DISCORD_BOT_TOKEN`) read through `get`.
fn apply_env_overrides(cfg: &mut ServerConfig, get: impl Fn(&str) -> Option<String>) {
	if let Some(v) = env_string(&get, "TRANSMUTER_BIND") {
		cfg.server.bind = Some(v);
		info!("server config: bind overridden by env");
	}

	if let Some(v) = env_string(&get, "TRANSMUTER_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string(&get, "TRANSMUTER_ALLOW_ORIGIN") {
		cfg.server.allow_origin = v;
		info!("server config: allow_origin overridden by env");
	}

	if let Some(capacity) = env_parse::<usize>(&get, "TRANSMUTER_CONNECTION_QUEUE_CAPACITY") {
		cfg.server.connection_queue_capacity = capacity;
		info!(capacity, "server config: connection_queue_capacity overridden by env");
	}

	if let Some(secs) = env_parse::<u64>(&get, "TRANSMUTER_KEEPALIVE_INTERVAL_SECS") {
		cfg.server.keepalive_interval = Duration::from_secs(secs);
		info!(secs, "server config: keepalive_interval overridden by env");
	}

	if let Some(secs) = env_parse::<u64>(&get, "TRANSMUTER_IDLE_TIMEOUT_SECS") {
		cfg.server.idle_timeout = Duration::from_secs(secs);
		info!(secs, "server config: idle_timeout overridden by env");
	}

	if let Some(bytes) = env_parse::<usize>(&get, "TRANSMUTER_MAX_FRAME_BYTES") {
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(capacity) = env_parse::<usize>(&get, "TRANSMUTER_HUB_COMMAND_CAPACITY") {
		cfg.hub.command_capacity = capacity;
		info!(capacity, "hub config: command_capacity overridden by env");
	}

	if let Some(capacity) = env_parse::<usize>(&get, "TRANSMUTER_WEBHOOK_QUEUE_CAPACITY") {
		cfg.hub.webhook_queue_capacity = capacity;
		info!(capacity, "hub config: webhook_queue_capacity overridden by env");
	}

	if let Some(v) = env_string(&get, "TRANSMUTER_HUB_DEBUG_LOGS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.hub.debug_logs = enabled;
		info!(enabled, "hub config: debug_logs overridden by env");
	}

	if let Some(v) = env_string(&get, "TRANSMUTER_DISCORD_BOT_TOKEN") {
		cfg.discord.bot_token = Some(SecretString::new(v));
		info!("discord config: bot_token overridden by env");
	} else if let Some(v) = env_string(&get, "DISCORD_BOT_TOKEN") {
		cfg.discord.bot_token = Some(SecretString::new(v));
		info!("discord config: bot_token taken from DISCORD_BOT_TOKEN");
	}

	if let Some(v) = env_string(&get, "TRANSMUTER_DISCORD_API_BASE_URL") {
		cfg.discord.api_base_url = v;
		info!("discord config: api_base_url overridden by env");
	}

	if let Some(v) = env_string(&get, "TRANSMUTER_DISCORD_GATEWAY_URL") {
		cfg.discord.gateway_url = v;
		info!("discord config: gateway_url overridden by env");
	}

	if let Some(intents) = env_parse::<u64>(&get, "TRANSMUTER_DISCORD_INTENTS") {
		cfg.discord.intents = intents;
		info!(intents, "discord config: intents overridden by env");
	}

	if let Some(v) = env_string(&get, "TRANSMUTER_WEBHOOK_NAME") {
		cfg.discord.webhook_name = v;
		info!("discord config: webhook_name overridden by env");
	}

	if let Some(ms) = env_parse::<u64>(&get, "TRANSMUTER_DISCORD_RECONNECT_MIN_DELAY_MS") {
		cfg.discord.reconnect_min_delay = Duration::from_millis(ms);
		debug!("discord config: reconnect_min_delay overridden by env");
	}

	if let Some(ms) = env_parse::<u64>(&get, "TRANSMUTER_DISCORD_RECONNECT_MAX_DELAY_MS") {
		cfg.discord.reconnect_max_delay = Duration::from_millis(ms);
		debug!("discord config: reconnect_max_delay overridden by env");
	}
}

/// Clamp values that would otherwise break the runtime.
fn normalize(cfg: &mut ServerConfig) {
	for (name, value) in [
		("connection_queue_capacity", &mut cfg.server.connection_queue_capacity),
		("command_capacity", &mut cfg.hub.command_capacity),
		("webhook_queue_capacity", &mut cfg.hub.webhook_queue_capacity),
	] {
		if *value == 0 {
			warn!(setting = name, "capacity of 0 is not usable; using 1");
			*value = 1;
		}
	}

	if cfg.server.keepalive_interval.is_zero() {
		warn!("server config: keepalive_interval of 0s; using 1s");
		cfg.server.keepalive_interval = Duration::from_secs(1);
	}

	if cfg.server.idle_timeout <= cfg.server.keepalive_interval {
		let idle = cfg.server.keepalive_interval * 3;
		warn!(
			idle_timeout_secs = cfg.server.idle_timeout.as_secs(),
			keepalive_secs = cfg.server.keepalive_interval.as_secs(),
			"server config: idle_timeout must exceed keepalive_interval; using 3x keepalive"
		);
		cfg.server.idle_timeout = idle;
	}

	if cfg.discord.reconnect_min_delay > cfg.discord.reconnect_max_delay {
		warn!(
			min_ms = cfg.discord.reconnect_min_delay.as_millis(),
			max_ms = cfg.discord.reconnect_max_delay.as_millis(),
			"discord config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		std::mem::swap(&mut cfg.discord.reconnect_min_delay, &mut cfg.discord.reconnect_max_delay);
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		move |key| map.get(key).cloned()
	}

	#[test]
	fn defaults_match_documented_values() {
		let cfg = ServerConfig::default();
		assert_eq!(cfg.server.bind, None);
		assert_eq!(cfg.server.allow_origin, "*");
		assert_eq!(cfg.server.connection_queue_capacity, 256);
		assert_eq!(cfg.discord.webhook_name, "Transmuter");
		assert_eq!(cfg.discord.api_base_url, DEFAULT_API_BASE_URL);
		assert_eq!(cfg.discord.intents, DEFAULT_INTENTS);
		assert!(cfg.discord.bot_token.is_none());
	}

	#[test]
	fn toml_sections_are_read() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			bind = "http://127.0.0.1:4000"
			allow_origin = "https://example.com"
			keepalive_interval_secs = 10

			[hub]
			webhook_queue_capacity = 8
			debug_logs = true

			[discord]
			bot_token = "  tok  "
			webhook_name = "Bridge"
			"#,
		)
		.unwrap();

		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.bind.as_deref(), Some("http://127.0.0.1:4000"));
		assert_eq!(cfg.server.allow_origin, "https://example.com");
		assert_eq!(cfg.server.keepalive_interval, Duration::from_secs(10));
		assert_eq!(cfg.hub.webhook_queue_capacity, 8);
		assert!(cfg.hub.debug_logs);
		assert_eq!(cfg.discord.bot_token.unwrap().expose(), "tok");
		assert_eq!(cfg.discord.webhook_name, "Bridge");
	}

	#[test]
	fn env_overrides_win_over_file() {
		let mut cfg = ServerConfig::default();
		apply_env_overrides(
			&mut cfg,
			env(&[
				("TRANSMUTER_BIND", "http://127.0.0.1:9000"),
				("TRANSMUTER_CONNECTION_QUEUE_CAPACITY", "32"),
				("TRANSMUTER_HUB_DEBUG_LOGS", "yes"),
				("TRANSMUTER_WEBHOOK_NAME", "Relay"),
			]),
		);

		assert_eq!(cfg.server.bind.as_deref(), Some("http://127.0.0.1:9000"));
		assert_eq!(cfg.server.connection_queue_capacity, 32);
		assert!(cfg.hub.debug_logs);
		assert_eq!(cfg.discord.webhook_name, "Relay");
	}

	#[test]
	fn unparsable_env_values_are_ignored() {
		let mut cfg = ServerConfig::default();
		apply_env_overrides(
			&mut cfg,
			env(&[
				("TRANSMUTER_CONNECTION_QUEUE_CAPACITY", "lots"),
				("TRANSMUTER_HUB_DEBUG_LOGS", "maybe"),
			]),
		);
		assert_eq!(cfg.server.connection_queue_capacity, 256);
		assert!(!cfg.hub.debug_logs);
	}

	#[test]
	fn legacy_token_variable_is_honored() {
		let mut cfg = ServerConfig::default();
		apply_env_overrides(&mut cfg, env(&[("DISCORD_BOT_TOKEN", "legacy")]));
		assert_eq!(cfg.discord.bot_token.as_ref().map(|t| t.expose()), Some("legacy"));

		let mut cfg = ServerConfig::default();
		apply_env_overrides(
			&mut cfg,
			env(&[("DISCORD_BOT_TOKEN", "legacy"), ("TRANSMUTER_DISCORD_BOT_TOKEN", "new")]),
		);
		assert_eq!(cfg.discord.bot_token.as_ref().map(|t| t.expose()), Some("new"));
	}

	#[test]
	fn normalize_repairs_unusable_values() {
		let mut cfg = ServerConfig::default();
		cfg.server.connection_queue_capacity = 0;
		cfg.server.keepalive_interval = Duration::from_secs(30);
		cfg.server.idle_timeout = Duration::from_secs(5);
		cfg.discord.reconnect_min_delay = Duration::from_secs(60);
		cfg.discord.reconnect_max_delay = Duration::from_secs(1);

		normalize(&mut cfg);

		assert_eq!(cfg.server.connection_queue_capacity, 1);
		assert_eq!(cfg.server.idle_timeout, Duration::from_secs(90));
		assert_eq!(cfg.discord.reconnect_min_delay, Duration::from_secs(1));
		assert_eq!(cfg.discord.reconnect_max_delay, Duration::from_secs(60));
	}

	#[test]
	fn missing_file_yields_defaults() {
		let path = std::env::temp_dir().join(format!("transmuter-missing-{}.toml", uuid::Uuid::new_v4()));
		assert!(read_toml_if_exists(&path).unwrap().is_none());
	}

	#[test]
	fn invalid_toml_is_an_error() {
		let path = std::env::temp_dir().join(format!("transmuter-bad-{}.toml", uuid::Uuid::new_v4()));
		fs::write(&path, "[server\nbind = ").unwrap();
		let res = read_toml_if_exists(&path);
		let _ = fs::remove_file(&path);
		assert!(res.is_err());
	}
}
