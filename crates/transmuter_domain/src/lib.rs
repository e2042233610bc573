#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest display name the platform accepts for a webhook username override.
pub const MAX_AUTHOR_LEN: usize = 80;

/// Longest message body the platform accepts.
pub const MAX_CONTENT_LEN: usize = 2000;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Platform channel identifier (a numeric snowflake).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
	/// Create a `ChannelId` from a non-empty, all-digit string.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
			return Err(ParseIdError::InvalidFormat(format!("expected numeric channel id, got {trimmed:?}")));
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelId::new(s.to_string())
	}
}

/// Opaque identity of one socket subscriber. Only used for set membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
	/// Create a new random connection id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// What happened to the relayed message on its source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
	#[default]
	Create,
	Update,
	Delete,
}

impl RelayKind {
	pub fn is_create(&self) -> bool {
		matches!(self, Self::Create)
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Create => "create",
			Self::Update => "update",
			Self::Delete => "delete",
		}
	}
}

impl fmt::Display for RelayKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A chat message routed through a hub.
///
/// The origin marker (`channelID` on the wire) is the only thing the hub looks at
/// to decide direction: empty means the message came from a socket client and must
/// be posted into the channel, non-empty means it came from the channel itself.
/// It is fixed by the constructor that produced the message and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayMessage {
	author: String,
	content: String,

	#[serde(rename = "channelID")]
	origin_channel_id: String,

	#[serde(skip_serializing_if = "RelayKind::is_create")]
	kind: RelayKind,

	#[serde(rename = "messageID", skip_serializing_if = "Option::is_none")]
	message_id: Option<String>,
}

impl RelayMessage {
	/// Message produced by the platform side for `channel`.
	pub fn from_platform(
		channel: &ChannelId,
		kind: RelayKind,
		author: impl Into<String>,
		content: impl Into<String>,
		message_id: Option<String>,
	) -> Self {
		Self {
			author: author.into(),
			content: content.into(),
			origin_channel_id: channel.as_str().to_string(),
			kind,
			message_id,
		}
	}

	/// Message produced by a socket client. The origin marker stays empty.
	pub fn from_socket(author: impl Into<String>, content: impl Into<String>) -> Self {
		Self {
			author: author.into(),
			content: content.into(),
			origin_channel_id: String::new(),
			kind: RelayKind::Create,
			message_id: None,
		}
	}

	/// Parse and validate a raw client frame (`{"author": .., "content": ..}`).
	///
	/// Any `channelID` the client sends is ignored.
	pub fn from_client_frame(raw: &str) -> Result<Self, FrameError> {
		let frame: ClientFrame = serde_json::from_str(raw)?;

		let author = frame.author.trim();
		if author.is_empty() {
			return Err(FrameError::EmptyAuthor);
		}
		let author_len = author.chars().count();
		if author_len > MAX_AUTHOR_LEN {
			return Err(FrameError::AuthorTooLong(author_len));
		}

		let content = frame.content.trim();
		if content.is_empty() {
			return Err(FrameError::EmptyContent);
		}
		let content_len = content.chars().count();
		if content_len > MAX_CONTENT_LEN {
			return Err(FrameError::ContentTooLong(content_len));
		}

		Ok(Self::from_socket(author, content))
	}

	pub fn author(&self) -> &str {
		&self.author
	}

	pub fn content(&self) -> &str {
		&self.content
	}

	/// The channel this message came from, if it came from the platform.
	pub fn origin_channel_id(&self) -> Option<&str> {
		if self.origin_channel_id.is_empty() {
			None
		} else {
			Some(&self.origin_channel_id)
		}
	}

	pub fn is_from_channel(&self) -> bool {
		!self.origin_channel_id.is_empty()
	}

	/// JSON fan-out payload (`{"author","content","channelID",...}`).
	pub fn encode_payload(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
	author: String,
	content: String,
}

/// Reasons a client frame is rejected.
#[derive(Debug, Error)]
pub enum FrameError {
	#[error("malformed frame: {0}")]
	Malformed(#[from] serde_json::Error),
	#[error("author must be non-empty")]
	EmptyAuthor,
	#[error("author too long ({0} chars, max {MAX_AUTHOR_LEN})")]
	AuthorTooLong(usize),
	#[error("content must be non-empty")]
	EmptyContent,
	#[error("content too long ({0} chars, max {MAX_CONTENT_LEN})")]
	ContentTooLong(usize),
}

impl FrameError {
	/// Stable label for metrics.
	pub const fn reason(&self) -> &'static str {
		match self {
			Self::Malformed(_) => "malformed",
			Self::EmptyAuthor => "empty_author",
			Self::AuthorTooLong(_) => "author_too_long",
			Self::EmptyContent => "empty_content",
			Self::ContentTooLong(_) => "content_too_long",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn channel(id: &str) -> ChannelId {
		ChannelId::new(id).unwrap()
	}

	#[test]
	fn channel_id_requires_digits() {
		assert_eq!(channel(" 1258912186244268104 ").as_str(), "1258912186244268104");
		assert_eq!("".parse::<ChannelId>(), Err(ParseIdError::Empty));
		assert!(matches!(ChannelId::new("12a"), Err(ParseIdError::InvalidFormat(_))));
		assert!(ChannelId::new("../etc").is_err());
	}

	#[test]
	fn platform_message_carries_origin() {
		let msg = RelayMessage::from_platform(&channel("123"), RelayKind::Create, "bot", "hi", None);
		assert!(msg.is_from_channel());
		assert_eq!(msg.origin_channel_id(), Some("123"));

		let payload: serde_json::Value = serde_json::from_str(&msg.encode_payload().unwrap()).unwrap();
		assert_eq!(payload, serde_json::json!({"author": "bot", "content": "hi", "channelID": "123"}));
	}

	#[test]
	fn socket_message_has_empty_origin_on_the_wire() {
		let msg = RelayMessage::from_socket("alice", "hello");
		assert!(!msg.is_from_channel());
		assert_eq!(msg.origin_channel_id(), None);

		let payload: serde_json::Value = serde_json::from_str(&msg.encode_payload().unwrap()).unwrap();
		assert_eq!(payload["channelID"], "");
		assert!(payload.get("kind").is_none());
	}

	#[test]
	fn non_create_kinds_are_tagged() {
		let msg = RelayMessage::from_platform(&channel("9"), RelayKind::Delete, "", "", Some("77".to_string()));
		let payload: serde_json::Value = serde_json::from_str(&msg.encode_payload().unwrap()).unwrap();
		assert_eq!(payload["kind"], "delete");
		assert_eq!(payload["messageID"], "77");
	}

	#[test]
	fn client_frame_cannot_spoof_origin() {
		let msg = RelayMessage::from_client_frame(r#"{"author":"mallory","content":"x","channelID":"123"}"#).unwrap();
		assert!(!msg.is_from_channel());
		assert_eq!(msg.author(), "mallory");
	}

	#[test]
	fn client_frame_validation() {
		assert!(matches!(
			RelayMessage::from_client_frame("not json"),
			Err(FrameError::Malformed(_))
		));
		assert!(matches!(
			RelayMessage::from_client_frame(r#"{"author":"  ","content":"x"}"#),
			Err(FrameError::EmptyAuthor)
		));
		assert!(matches!(
			RelayMessage::from_client_frame(r#"{"author":"a","content":""}"#),
			Err(FrameError::EmptyContent)
		));

		let long_author = format!(r#"{{"author":"{}","content":"x"}}"#, "a".repeat(MAX_AUTHOR_LEN + 1));
		assert!(matches!(
			RelayMessage::from_client_frame(&long_author),
			Err(FrameError::AuthorTooLong(81))
		));

		let msg = RelayMessage::from_client_frame(r#"{"author":" alice ","content":" hello "}"#).unwrap();
		assert_eq!(msg.author(), "alice");
		assert_eq!(msg.content(), "hello");
	}
}
