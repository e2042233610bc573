#![forbid(unsafe_code)]

pub mod discord;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use transmuter_domain::ChannelId;
use uuid::Uuid;

/// Server → adapter control message.
#[derive(Debug)]
pub enum AdapterControl {
	/// Request a graceful shutdown.
	Shutdown,
}

/// Adapter → server event message.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
	/// A message event observed in some channel.
	Message(Box<ChannelEvent>),

	/// Adapter status update.
	Status(AdapterStatus),
}

/// Kind of channel message event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEventKind {
	Created,
	Updated,
	Deleted,
}

/// Author of a channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAuthor {
	pub id: String,

	/// Display name (global name when set, username otherwise).
	pub name: String,

	pub bot: bool,
}

/// Normalized message event from the platform gateway.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
	pub kind: ChannelEventKind,
	pub channel_id: ChannelId,
	pub message_id: String,

	/// Absent on deletes and on some partial updates.
	pub author: Option<ChannelAuthor>,

	pub content: String,

	/// Set when the message was posted through a webhook.
	pub webhook_id: Option<String>,
}

/// Adapter status event.
#[derive(Debug, Clone)]
pub struct AdapterStatus {
	pub connected: bool,
	pub detail: String,
	pub last_error: Option<String>,
}

pub type AdapterControlTx = mpsc::Sender<AdapterControl>;
pub type AdapterControlRx = mpsc::Receiver<AdapterControl>;
pub type AdapterEventTx = mpsc::Sender<AdapterEvent>;
pub type AdapterEventRx = mpsc::Receiver<AdapterEvent>;

/// Build a standard bounded channel pair.
pub fn bounded_adapter_channels(
	control_capacity: usize,
	events_capacity: usize,
) -> (AdapterControlTx, AdapterControlRx, AdapterEventTx, AdapterEventRx) {
	let (control_tx, control_rx) = mpsc::channel(control_capacity);
	let (events_tx, events_rx) = mpsc::channel(events_capacity);
	(control_tx, control_rx, events_tx, events_rx)
}

/// Build a status event.
pub fn status(connected: bool, detail: impl Into<String>) -> AdapterEvent {
	AdapterEvent::Status(AdapterStatus {
		connected,
		detail: detail.into(),
		last_error: None,
	})
}

/// Build an error status event.
pub fn status_error(detail: impl Into<String>, err: impl fmt::Display) -> AdapterEvent {
	AdapterEvent::Status(AdapterStatus {
		connected: false,
		detail: detail.into(),
		last_error: Some(err.to_string()),
	})
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Webhook kinds as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "u8")]
pub enum WebhookKind {
	/// Can be executed with its token; the only kind usable for posting.
	Incoming,
	ChannelFollower,
	Application,
	Unknown(u8),
}

impl From<u8> for WebhookKind {
	fn from(v: u8) -> Self {
		match v {
			1 => Self::Incoming,
			2 => Self::ChannelFollower,
			3 => Self::Application,
			other => Self::Unknown(other),
		}
	}
}

/// Webhook as listed/created on a channel.
#[derive(Debug, Clone, Deserialize)]
pub struct Webhook {
	pub id: String,

	#[serde(rename = "type")]
	pub kind: WebhookKind,

	#[serde(default)]
	pub name: Option<String>,

	#[serde(default)]
	pub channel_id: Option<String>,

	/// Only present for incoming webhooks the bot can see the secret of.
	#[serde(default)]
	pub token: Option<SecretString>,
}

impl Webhook {
	/// Binding usable for execution, if this webhook can post.
	pub fn binding(&self) -> Option<WebhookBinding> {
		if self.kind != WebhookKind::Incoming {
			return None;
		}
		let token = self.token.as_ref().filter(|t| !t.expose().is_empty())?;
		Some(WebhookBinding {
			id: self.id.clone(),
			token: token.clone(),
		})
	}
}

/// `(id, token)` pair needed to post through a webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookBinding {
	pub id: String,
	pub token: SecretString,
}

impl WebhookBinding {
	/// Public execute URL for this binding.
	pub fn execute_url(&self) -> String {
		format!(
			"https://discord.com/api/webhooks/{}/{}?wait=true",
			self.id,
			self.token.expose()
		)
	}
}

/// Body of a webhook execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookParams {
	pub content: String,

	/// Display-name override for the posted message.
	pub username: String,
}

/// Channel message history query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
	pub limit: u8,
	pub before: Option<String>,
	pub after: Option<String>,
}

impl Default for HistoryQuery {
	fn default() -> Self {
		Self {
			limit: 100,
			before: None,
			after: None,
		}
	}
}

/// Errors from platform REST calls.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
	#[error("request failed: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("credentials rejected (status={status})")]
	Unauthorized { status: u16 },

	#[error("not found: {0}")]
	NotFound(String),

	#[error("rate limited (retry_after={retry_after:?})")]
	RateLimited { retry_after: Option<Duration> },

	#[error("request failed: status={status} body={body}")]
	Status { status: u16, body: String },

	#[error("webhook {0} has no usable token")]
	MissingToken(String),

	#[error("decode response: {0}")]
	Decode(#[from] serde_json::Error),

	#[error("invalid url: {0}")]
	Url(#[from] url::ParseError),
}

impl PlatformError {
	/// Whether the referenced resource no longer exists.
	pub fn is_not_found(&self) -> bool {
		matches!(self, Self::NotFound(_))
	}
}

/// Channel-scoped REST operations the relay needs from the platform.
#[async_trait]
pub trait ChannelApi: Send + Sync + 'static {
	/// List webhooks configured on `channel`.
	async fn channel_webhooks(&self, channel: &ChannelId) -> Result<Vec<Webhook>, PlatformError>;

	/// Create an incoming webhook named `name` on `channel`.
	async fn create_webhook(&self, channel: &ChannelId, name: &str) -> Result<Webhook, PlatformError>;

	/// Post through a webhook.
	async fn execute_webhook(&self, binding: &WebhookBinding, params: &WebhookParams) -> Result<(), PlatformError>;

	/// Fetch recent channel messages as the platform's raw JSON.
	async fn channel_messages(&self, channel: &ChannelId, query: &HistoryQuery) -> Result<serde_json::Value, PlatformError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_string_is_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.to_string(), "<redacted>");
		assert_eq!(s.expose(), "hunter2");
	}

	#[test]
	fn only_incoming_webhooks_with_token_bind() {
		let incoming: Webhook =
			serde_json::from_value(serde_json::json!({"id": "1", "type": 1, "token": "tok", "name": "Transmuter"})).unwrap();
		let follower: Webhook = serde_json::from_value(serde_json::json!({"id": "2", "type": 2})).unwrap();
		let tokenless: Webhook = serde_json::from_value(serde_json::json!({"id": "3", "type": 1})).unwrap();

		let binding = incoming.binding().unwrap();
		assert_eq!(binding.id, "1");
		assert_eq!(binding.execute_url(), "https://discord.com/api/webhooks/1/tok?wait=true");
		assert!(follower.binding().is_none());
		assert!(tokenless.binding().is_none());
	}

	#[test]
	fn unknown_webhook_kind_is_preserved() {
		assert_eq!(WebhookKind::from(9), WebhookKind::Unknown(9));
	}
}
