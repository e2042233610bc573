#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tracing::debug;
use transmuter_domain::ChannelId;
use url::Url;

use crate::{ChannelApi, HistoryQuery, PlatformError, SecretString, Webhook, WebhookBinding, WebhookParams};

pub const DEFAULT_API_BASE_URL: &str = "https://discord.com/api/v10/";

const USER_AGENT: &str = "DiscordBot (transmuter, 0.1)";

/// Longest wait honored before retrying a rate-limited request.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct RateLimitBody {
	retry_after: f64,
}

/// Advertised delay in seconds; values too large to represent saturate.
fn delay_from_secs(secs: f64) -> Duration {
	Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	[RETRY_AFTER.as_str(), "X-RateLimit-Reset-After"].into_iter().find_map(|name| {
		let secs = headers.get(name)?.to_str().ok()?.trim().parse::<f64>().ok()?;
		Some(delay_from_secs(secs))
	})
}

/// Send once; retry a single time on 429 (honoring the advertised delay) or 5xx.
async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> Result<reqwest::Response, PlatformError> {
	let retry_builder = req.try_clone();
	let resp = req.send().await?;
	let status = resp.status();

	if status == StatusCode::TOO_MANY_REQUESTS {
		let delay = retry_delay_from_headers(resp.headers());
		let delay = match delay {
			Some(d) => Some(d),
			None => resp
				.json::<RateLimitBody>()
				.await
				.ok()
				.map(|b| delay_from_secs(b.retry_after)),
		};

		return match (delay, retry_builder) {
			(Some(d), Some(retry)) if d <= MAX_RETRY_DELAY => {
				debug!(label, delay_ms = d.as_millis() as u64, "discord rate limited; retrying once");
				tokio::time::sleep(d).await;
				Ok(retry.send().await?)
			}
			(retry_after, _) => Err(PlatformError::RateLimited { retry_after }),
		};
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		debug!(label, %status, "discord server error; retrying once");
		tokio::time::sleep(Duration::from_millis(250)).await;
		return Ok(retry.send().await?);
	}

	Ok(resp)
}

/// Map a non-success response to a `PlatformError`.
async fn error_for_status(resp: reqwest::Response, what: &str) -> PlatformError {
	let status = resp.status();
	let body = resp.text().await.unwrap_or_default();

	match status {
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Unauthorized {
			status: status.as_u16(),
		},
		StatusCode::NOT_FOUND => PlatformError::NotFound(what.to_string()),
		StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited { retry_after: None },
		_ => PlatformError::Status {
			status: status.as_u16(),
			body,
		},
	}
}

#[derive(Debug, Serialize)]
struct CreateWebhookRequest<'a> {
	name: &'a str,
}

#[derive(Debug, Serialize)]
struct ExecuteWebhookRequest<'a> {
	content: &'a str,
	username: &'a str,
	allowed_mentions: AllowedMentions,
}

#[derive(Debug, Serialize)]
struct AllowedMentions {
	parse: [&'static str; 0],
}

/// Bot-authenticated Discord REST client.
#[derive(Clone, Debug)]
pub struct DiscordRestClient {
	http: reqwest::Client,
	base_url: Url,
	bot_token: SecretString,
}

impl DiscordRestClient {
	pub fn new(base_url: &str, bot_token: SecretString) -> Result<Self, PlatformError> {
		let http = reqwest::Client::builder()
			.user_agent(USER_AGENT)
			.timeout(Duration::from_secs(15))
			.build()?;

		// `Url::join` drops the last path segment unless the base ends with '/'.
		let base_url = if base_url.ends_with('/') {
			Url::parse(base_url)?
		} else {
			Url::parse(&format!("{base_url}/"))?
		};

		Ok(Self {
			http,
			base_url,
			bot_token,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Authorization", format!("Bot {}", self.bot_token.expose()))
	}

	fn url(&self, path: &str) -> Result<Url, PlatformError> {
		Ok(self.base_url.join(path.trim_start_matches('/'))?)
	}
}

#[async_trait]
impl ChannelApi for DiscordRestClient {
	async fn channel_webhooks(&self, channel: &ChannelId) -> Result<Vec<Webhook>, PlatformError> {
		let url = self.url(&format!("channels/{channel}/webhooks"))?;
		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /channels/{id}/webhooks").await?;

		if !resp.status().is_success() {
			return Err(error_for_status(resp, &format!("channel {channel}")).await);
		}

		let body = resp.text().await?;
		Ok(serde_json::from_str(&body)?)
	}

	async fn create_webhook(&self, channel: &ChannelId, name: &str) -> Result<Webhook, PlatformError> {
		let url = self.url(&format!("channels/{channel}/webhooks"))?;
		let req = self.authed(self.http.post(url)).json(&CreateWebhookRequest { name });
		let resp = send_with_retry(req, "POST /channels/{id}/webhooks").await?;

		if !resp.status().is_success() {
			return Err(error_for_status(resp, &format!("channel {channel}")).await);
		}

		let body = resp.text().await?;
		Ok(serde_json::from_str(&body)?)
	}

	async fn execute_webhook(&self, binding: &WebhookBinding, params: &WebhookParams) -> Result<(), PlatformError> {
		// Execution is authorized by the webhook token in the path, not the bot token.
		let mut url = self.url(&format!(
			"webhooks/{}/{}",
			urlencoding::encode(&binding.id),
			urlencoding::encode(binding.token.expose())
		))?;
		url.query_pairs_mut().append_pair("wait", "true");

		let req = self.http.post(url).json(&ExecuteWebhookRequest {
			content: &params.content,
			username: &params.username,
			allowed_mentions: AllowedMentions { parse: [] },
		});
		let resp = send_with_retry(req, "POST /webhooks/{id}/{token}").await?;

		if !resp.status().is_success() {
			return Err(error_for_status(resp, &format!("webhook {}", binding.id)).await);
		}

		Ok(())
	}

	async fn channel_messages(&self, channel: &ChannelId, query: &HistoryQuery) -> Result<serde_json::Value, PlatformError> {
		let mut url = self.url(&format!("channels/{channel}/messages"))?;
		{
			let mut pairs = url.query_pairs_mut();
			pairs.append_pair("limit", &query.limit.clamp(1, 100).to_string());
			if let Some(before) = query.before.as_deref() {
				pairs.append_pair("before", before);
			}
			if let Some(after) = query.after.as_deref() {
				pairs.append_pair("after", after);
			}
		}

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /channels/{id}/messages").await?;

		if !resp.status().is_success() {
			return Err(error_for_status(resp, &format!("channel {channel}")).await);
		}

		let body = resp.text().await?;
		Ok(serde_json::from_str(&body)?)
	}
}
