#![forbid(unsafe_code)]

use anyhow::Context;
use serde::Deserialize;
use serde_json::json;
use transmuter_domain::ChannelId;

use crate::{ChannelAuthor, ChannelEvent, ChannelEventKind};

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT.
pub const DEFAULT_INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 15);

pub(crate) mod opcode {
	pub(crate) const DISPATCH: u8 = 0;
	pub(crate) const HEARTBEAT: u8 = 1;
	pub(crate) const IDENTIFY: u8 = 2;
	pub(crate) const RESUME: u8 = 6;
	pub(crate) const RECONNECT: u8 = 7;
	pub(crate) const INVALID_SESSION: u8 = 9;
	pub(crate) const HELLO: u8 = 10;
	pub(crate) const HEARTBEAT_ACK: u8 = 11;
}

/// Close codes after which reconnecting cannot help.
pub(crate) fn is_fatal_close_code(code: u16) -> bool {
	matches!(code, 4004 | 4010 | 4011 | 4012 | 4013 | 4014)
}

/// Close codes after which the session cannot be resumed.
pub(crate) fn invalidates_session(code: u16) -> bool {
	matches!(code, 4007 | 4009)
}

/// Envelope of every gateway message.
#[derive(Debug, Deserialize)]
pub(crate) struct GatewayPayload {
	pub(crate) op: u8,

	#[serde(default)]
	pub(crate) d: serde_json::Value,

	#[serde(default)]
	pub(crate) s: Option<u64>,

	#[serde(default)]
	pub(crate) t: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelloData {
	pub(crate) heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadyData {
	pub(crate) session_id: String,

	#[serde(default)]
	pub(crate) resume_gateway_url: Option<String>,

	pub(crate) user: GatewayUser,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayUser {
	pub(crate) id: String,
	pub(crate) username: String,

	#[serde(default)]
	pub(crate) global_name: Option<String>,

	#[serde(default)]
	pub(crate) bot: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayMember {
	#[serde(default)]
	pub(crate) nick: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageData {
	pub(crate) id: String,
	pub(crate) channel_id: String,

	#[serde(default)]
	pub(crate) author: Option<GatewayUser>,

	#[serde(default)]
	pub(crate) member: Option<GatewayMember>,

	/// Missing on updates that only touched embeds.
	#[serde(default)]
	pub(crate) content: Option<String>,

	#[serde(default)]
	pub(crate) webhook_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageDeleteData {
	pub(crate) id: String,
	pub(crate) channel_id: String,
}

pub(crate) fn parse_payload(raw_json: &str) -> anyhow::Result<GatewayPayload> {
	serde_json::from_str(raw_json).context("parse gateway payload")
}

pub(crate) fn parse_hello(payload: GatewayPayload) -> anyhow::Result<HelloData> {
	if payload.op != opcode::HELLO {
		anyhow::bail!("expected HELLO (op 10), got op {}", payload.op);
	}
	serde_json::from_value(payload.d).context("parse HELLO data")
}

pub(crate) fn parse_ready(d: serde_json::Value) -> anyhow::Result<ReadyData> {
	serde_json::from_value(d).context("parse READY data")
}

pub(crate) fn identify_payload(token: &str, intents: u64) -> String {
	json!({
		"op": opcode::IDENTIFY,
		"d": {
			"token": token,
			"intents": intents,
			"properties": {
				"os": std::env::consts::OS,
				"browser": "transmuter",
				"device": "transmuter",
			},
		},
	})
	.to_string()
}

pub(crate) fn resume_payload(token: &str, session_id: &str, seq: Option<u64>) -> String {
	json!({
		"op": opcode::RESUME,
		"d": {
			"token": token,
			"session_id": session_id,
			"seq": seq,
		},
	})
	.to_string()
}

pub(crate) fn heartbeat_payload(seq: Option<u64>) -> String {
	json!({ "op": opcode::HEARTBEAT, "d": seq }).to_string()
}

fn display_name(user: &GatewayUser, member: Option<&GatewayMember>) -> String {
	member
		.and_then(|m| m.nick.clone())
		.or_else(|| user.global_name.clone())
		.filter(|n| !n.trim().is_empty())
		.unwrap_or_else(|| user.username.clone())
}

/// Turn a message dispatch into a `ChannelEvent`.
///
/// Returns `Ok(None)` for dispatches that are not message events, for messages
/// authored by `self_user_id`, and for updates that carry no content.
pub(crate) fn normalize_dispatch(
	event_name: &str,
	d: serde_json::Value,
	self_user_id: Option<&str>,
) -> anyhow::Result<Option<ChannelEvent>> {
	let kind = match event_name {
		"MESSAGE_CREATE" => ChannelEventKind::Created,
		"MESSAGE_UPDATE" => ChannelEventKind::Updated,
		"MESSAGE_DELETE" => {
			let del: MessageDeleteData = serde_json::from_value(d).context("parse MESSAGE_DELETE data")?;
			let channel_id = ChannelId::new(del.channel_id).context("MESSAGE_DELETE channel_id")?;
			return Ok(Some(ChannelEvent {
				kind: ChannelEventKind::Deleted,
				channel_id,
				message_id: del.id,
				author: None,
				content: String::new(),
				webhook_id: None,
			}));
		}
		_ => return Ok(None),
	};

	let msg: MessageData = serde_json::from_value(d).with_context(|| format!("parse {event_name} data"))?;

	if let (Some(author), Some(me)) = (msg.author.as_ref(), self_user_id)
		&& author.id == me
	{
		return Ok(None);
	}

	let Some(content) = msg.content else {
		return Ok(None);
	};

	let channel_id = ChannelId::new(msg.channel_id).with_context(|| format!("{event_name} channel_id"))?;
	let author = msg.author.as_ref().map(|u| ChannelAuthor {
		id: u.id.clone(),
		name: display_name(u, msg.member.as_ref()),
		bot: u.bot,
	});

	Ok(Some(ChannelEvent {
		kind,
		channel_id,
		message_id: msg.id,
		author,
		content,
		webhook_id: msg.webhook_id,
	}))
}
