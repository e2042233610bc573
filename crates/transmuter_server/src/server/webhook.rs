#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use transmuter_domain::ChannelId;
use transmuter_platform::{ChannelApi, PlatformError, Webhook, WebhookBinding, WebhookParams};

/// A socket message waiting to be posted into the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookJob {
	pub author: String,
	pub content: String,
}

/// Owns the single posting webhook of one channel.
///
/// The binding is looked up (or created) on first use and cached afterwards. The
/// async mutex makes lookup/creation single-flight, so concurrent first use creates
/// at most one webhook.
pub struct WebhookProvisioner {
	api: Arc<dyn ChannelApi>,
	channel_id: ChannelId,
	webhook_name: String,
	binding: Mutex<Option<WebhookBinding>>,

	/// Id of the cached binding, readable without awaiting the mutex.
	known_id: RwLock<Option<String>>,
}

impl std::fmt::Debug for WebhookProvisioner {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WebhookProvisioner")
			.field("channel_id", &self.channel_id)
			.field("webhook_name", &self.webhook_name)
			.field("known_id", &*self.known_id.read())
			.finish()
	}
}

impl WebhookProvisioner {
	pub fn new(api: Arc<dyn ChannelApi>, channel_id: ChannelId, webhook_name: impl Into<String>) -> Self {
		Self {
			api,
			channel_id,
			webhook_name: webhook_name.into(),
			binding: Mutex::new(None),
			known_id: RwLock::new(None),
		}
	}

	pub fn channel_id(&self) -> &ChannelId {
		&self.channel_id
	}

	/// Whether `webhook_id` is the webhook this provisioner posts through.
	pub fn is_own_webhook(&self, webhook_id: &str) -> bool {
		self.known_id.read().as_deref() == Some(webhook_id)
	}

	/// Return the cached binding, or find/create one.
	pub async fn ensure_binding(&self) -> Result<WebhookBinding, PlatformError> {
		let mut cached = self.binding.lock().await;
		if let Some(binding) = cached.as_ref() {
			return Ok(binding.clone());
		}

		let hooks = self.api.channel_webhooks(&self.channel_id).await?;

		let binding = match hooks.iter().find_map(Webhook::binding) {
			Some(binding) => {
				debug!(channel = %self.channel_id, webhook = %binding.id, "reusing existing incoming webhook");
				binding
			}
			None => {
				info!(
					channel = %self.channel_id,
					existing = hooks.len(),
					name = %self.webhook_name,
					"no usable incoming webhook on channel; creating one"
				);
				let created = self.api.create_webhook(&self.channel_id, &self.webhook_name).await?;
				metrics::counter!("transmuter_webhooks_created_total").increment(1);
				created.binding().ok_or(PlatformError::MissingToken(created.id))?
			}
		};

		*self.known_id.write() = Some(binding.id.clone());
		*cached = Some(binding.clone());
		Ok(binding)
	}

	/// Post `content` into the channel under the display name `author`.
	pub async fn ensure_and_execute(&self, author: &str, content: &str) -> Result<(), PlatformError> {
		let binding = self.ensure_binding().await?;
		let params = WebhookParams {
			content: content.to_string(),
			username: author.to_string(),
		};

		match self.api.execute_webhook(&binding, &params).await {
			Err(e) if e.is_not_found() => {
				self.forget(&binding).await;
				Err(e)
			}
			other => other,
		}
	}

	/// Drop the cached binding if it is still `stale`; the next use re-lists.
	async fn forget(&self, stale: &WebhookBinding) {
		let mut cached = self.binding.lock().await;
		if cached.as_ref() == Some(stale) {
			*cached = None;
			*self.known_id.write() = None;
			warn!(channel = %self.channel_id, webhook = %stale.id, "webhook no longer exists; cache dropped");
		}
	}
}

fn result_label(res: &Result<(), PlatformError>) -> &'static str {
	match res {
		Ok(()) => "ok",
		Err(PlatformError::NotFound(_)) => "not_found",
		Err(PlatformError::RateLimited { .. }) => "rate_limited",
		Err(PlatformError::Unauthorized { .. }) => "unauthorized",
		Err(_) => "error",
	}
}

/// Spawn the per-channel worker that posts socket messages in order.
pub fn spawn_webhook_dispatcher(provisioner: Arc<WebhookProvisioner>, capacity: usize) -> mpsc::Sender<WebhookJob> {
	let (tx, mut rx) = mpsc::channel::<WebhookJob>(capacity.max(1));

	tokio::spawn(async move {
		while let Some(job) = rx.recv().await {
			let res = provisioner.ensure_and_execute(&job.author, &job.content).await;
			metrics::counter!("transmuter_webhook_executions_total", "result" => result_label(&res)).increment(1);

			match res {
				Ok(()) => debug!(channel = %provisioner.channel_id(), author = %job.author, "relayed socket message to channel"),
				Err(e) => warn!(channel = %provisioner.channel_id(), error = %e, "failed to relay socket message to channel"),
			}
		}

		debug!(channel = %provisioner.channel_id(), "webhook dispatcher stopped");
	});

	tx
}
