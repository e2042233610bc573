#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::timeout;
use transmuter_domain::ChannelId;
use transmuter_platform::{ChannelApi, HistoryQuery, PlatformError, Webhook, WebhookBinding, WebhookParams};

use crate::server::connection::OutboundQueue;

/// In-memory `ChannelApi` that records every call.
#[derive(Default)]
pub(crate) struct MockChannelApi {
	pub(crate) webhooks: Mutex<Vec<Webhook>>,
	pub(crate) list_calls: AtomicUsize,
	pub(crate) create_calls: AtomicUsize,
	pub(crate) executions: Mutex<Vec<(WebhookBinding, WebhookParams)>>,
	pub(crate) execute_failures: Mutex<VecDeque<PlatformError>>,
	pub(crate) create_delay: Duration,
	pub(crate) history: serde_json::Value,
	pub(crate) history_queries: Mutex<Vec<HistoryQuery>>,
}

impl MockChannelApi {
	pub(crate) fn with_webhooks(hooks: Vec<Webhook>) -> Self {
		Self {
			webhooks: Mutex::new(hooks),
			..Self::default()
		}
	}

	pub(crate) fn executed(&self) -> Vec<WebhookParams> {
		self.executions.lock().iter().map(|(_, p)| p.clone()).collect()
	}

	pub(crate) fn executed_via(&self) -> Vec<String> {
		self.executions.lock().iter().map(|(b, _)| b.id.clone()).collect()
	}

	pub(crate) fn lists(&self) -> usize {
		self.list_calls.load(Ordering::SeqCst)
	}

	pub(crate) fn creates(&self) -> usize {
		self.create_calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl ChannelApi for MockChannelApi {
	async fn channel_webhooks(&self, _channel: &ChannelId) -> Result<Vec<Webhook>, PlatformError> {
		self.list_calls.fetch_add(1, Ordering::SeqCst);
		Ok(self.webhooks.lock().clone())
	}

	async fn create_webhook(&self, _channel: &ChannelId, name: &str) -> Result<Webhook, PlatformError> {
		let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
		if !self.create_delay.is_zero() {
			tokio::time::sleep(self.create_delay).await;
		}

		let mut hook = webhook(&format!("created-{n}"), 1, Some("created-token"));
		hook.name = Some(name.to_string());
		self.webhooks.lock().push(hook.clone());
		Ok(hook)
	}

	async fn execute_webhook(&self, binding: &WebhookBinding, params: &WebhookParams) -> Result<(), PlatformError> {
		if let Some(err) = self.execute_failures.lock().pop_front() {
			return Err(err);
		}
		self.executions.lock().push((binding.clone(), params.clone()));
		Ok(())
	}

	async fn channel_messages(&self, _channel: &ChannelId, query: &HistoryQuery) -> Result<serde_json::Value, PlatformError> {
		self.history_queries.lock().push(query.clone());
		Ok(self.history.clone())
	}
}

pub(crate) fn webhook(id: &str, kind: u8, token: Option<&str>) -> Webhook {
	serde_json::from_value(serde_json::json!({
		"id": id,
		"type": kind,
		"token": token,
	}))
	.expect("valid webhook json")
}

pub(crate) fn channel(id: &str) -> ChannelId {
	ChannelId::new(id).expect("valid channel id")
}

/// Poll `cond` until it holds or about a second passes.
pub(crate) async fn eventually(cond: impl Fn() -> bool) -> bool {
	for _ in 0..100 {
		if cond() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	cond()
}

pub(crate) async fn recv_json(rx: &mut OutboundQueue) -> serde_json::Value {
	let payload: Bytes = timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("payload within timeout")
		.expect("queue open");
	serde_json::from_slice(&payload).expect("json payload")
}
