#![forbid(unsafe_code)]

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transmuter_domain::{RelayKind, RelayMessage};
use transmuter_platform::{AdapterEvent, AdapterEventRx, AdapterStatus, ChannelEvent, ChannelEventKind};

use crate::server::registry::HubRegistry;

/// Settings for the platform router.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
	pub debug_log_events: bool,
}

/// Consumes gateway events and publishes them into the hub of their channel.
pub struct PlatformRouter {
	cfg: RouterConfig,
	registry: HubRegistry,
	events_rx: AdapterEventRx,
}

fn relay_kind(kind: ChannelEventKind) -> RelayKind {
	match kind {
		ChannelEventKind::Created => RelayKind::Create,
		ChannelEventKind::Updated => RelayKind::Update,
		ChannelEventKind::Deleted => RelayKind::Delete,
	}
}

impl PlatformRouter {
	pub fn new(events_rx: AdapterEventRx, registry: HubRegistry, cfg: RouterConfig) -> Self {
		Self {
			cfg,
			registry,
			events_rx,
		}
	}

	/// Run until the adapter's event channel closes.
	pub async fn run(mut self) {
		info!("platform router started");

		while let Some(ev) = self.events_rx.recv().await {
			route_event(&self.registry, ev, &self.cfg).await;
		}

		info!("platform router exiting (adapter event channel closed)");
	}
}

/// Route one adapter event.
pub async fn route_event(registry: &HubRegistry, ev: AdapterEvent, cfg: &RouterConfig) {
	match ev {
		AdapterEvent::Message(ev) => route_message(registry, *ev, cfg).await,
		AdapterEvent::Status(status) => record_status(&status),
	}
}

async fn route_message(registry: &HubRegistry, ev: ChannelEvent, cfg: &RouterConfig) {
	let Some(entry) = registry.get(&ev.channel_id) else {
		if cfg.debug_log_events {
			debug!(channel = %ev.channel_id, "no hub for channel; dropping event");
		}
		return;
	};

	if let Some(webhook_id) = ev.webhook_id.as_deref()
		&& entry.provisioner.is_own_webhook(webhook_id)
	{
		metrics::counter!("transmuter_router_echoes_dropped_total").increment(1);
		if cfg.debug_log_events {
			debug!(channel = %ev.channel_id, webhook = webhook_id, "dropping echo of own webhook post");
		}
		return;
	}

	if cfg.debug_log_events {
		debug!(channel = %ev.channel_id, kind = ?ev.kind, message = %ev.message_id, "routing channel event to hub");
	}

	let author = ev.author.map(|a| a.name).unwrap_or_default();
	let msg = RelayMessage::from_platform(
		&ev.channel_id,
		relay_kind(ev.kind),
		author,
		ev.content,
		Some(ev.message_id),
	);

	entry.handle.publish(msg).await;
}

fn record_status(status: &AdapterStatus) {
	let connected = if status.connected { "true" } else { "false" };
	metrics::counter!("transmuter_gateway_status_total", "connected" => connected).increment(1);

	match status.last_error.as_deref() {
		Some(err) => warn!(detail = %status.detail, error = err, "gateway status"),
		None if status.connected => info!(detail = %status.detail, "gateway status"),
		None => debug!(detail = %status.detail, "gateway status"),
	}
}

/// Spawn a background task that routes gateway events into channel hubs.
pub fn spawn_platform_router(registry: HubRegistry, events_rx: AdapterEventRx, cfg: RouterConfig) -> JoinHandle<()> {
	let router = PlatformRouter::new(events_rx, registry, cfg);
	tokio::spawn(router.run())
}
