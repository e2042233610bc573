#![forbid(unsafe_code)]

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use transmuter_domain::{ChannelId, ConnectionId, RelayMessage};

use crate::server::connection::Connection;
use crate::server::webhook::WebhookJob;

/// Configuration for a channel hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Depth of the command queue feeding the hub loop.
	pub command_capacity: usize,

	pub debug_logs: bool,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			command_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Commands serialized through the hub loop.
#[derive(Debug)]
pub enum HubCommand {
	Register(Connection),
	Unregister(ConnectionId),
	Publish(RelayMessage),
	ConnectionCount(oneshot::Sender<usize>),
	Shutdown,
}

/// Cheap, cloneable handle to a running hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
	channel_id: ChannelId,
	tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
	pub fn channel_id(&self) -> &ChannelId {
		&self.channel_id
	}

	/// Whether the hub loop has stopped.
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}

	pub async fn register(&self, conn: Connection) -> anyhow::Result<()> {
		self.tx
			.send(HubCommand::Register(conn))
			.await
			.map_err(|_| anyhow::anyhow!("hub for channel {} has stopped", self.channel_id))
	}

	pub async fn unregister(&self, id: ConnectionId) {
		let _ = self.tx.send(HubCommand::Unregister(id)).await;
	}

	pub async fn publish(&self, msg: RelayMessage) {
		if self.tx.send(HubCommand::Publish(msg)).await.is_err() {
			debug!(channel = %self.channel_id, "publish after hub stopped; dropping message");
		}
	}

	/// Number of registered connections, observed after every earlier command.
	pub async fn connection_count(&self) -> Option<usize> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self.tx.send(HubCommand::ConnectionCount(reply_tx)).await.ok()?;
		reply_rx.await.ok()
	}

	/// Close every connection queue and stop the loop.
	pub async fn shutdown(&self) {
		let _ = self.tx.send(HubCommand::Shutdown).await;
	}
}

/// Spawn the hub loop for `channel_id`.
///
/// Socket-originated messages are handed to `webhook_tx` once per publish.
pub fn spawn_hub(channel_id: ChannelId, cfg: HubConfig, webhook_tx: mpsc::Sender<WebhookJob>) -> HubHandle {
	let (tx, rx) = mpsc::channel(cfg.command_capacity.max(1));

	let hub = Hub {
		channel_id: channel_id.clone(),
		cfg,
		connections: HashMap::new(),
		webhook_tx,
		rx,
		webhook_dropped: 0,
	};
	tokio::spawn(hub.run());

	HubHandle { channel_id, tx }
}

struct Hub {
	channel_id: ChannelId,
	cfg: HubConfig,
	connections: HashMap<ConnectionId, mpsc::Sender<Bytes>>,
	webhook_tx: mpsc::Sender<WebhookJob>,
	rx: mpsc::Receiver<HubCommand>,
	webhook_dropped: u64,
}

impl Hub {
	async fn run(mut self) {
		info!(channel = %self.channel_id, "hub started");

		while let Some(cmd) = self.rx.recv().await {
			match cmd {
				HubCommand::Register(conn) => self.register(conn),
				HubCommand::Unregister(id) => self.unregister(id),
				HubCommand::Publish(msg) => self.publish(msg),
				HubCommand::ConnectionCount(reply) => {
					let _ = reply.send(self.connections.len());
				}
				HubCommand::Shutdown => break,
			}
		}

		let closed = self.connections.len();
		self.connections.clear();
		self.record_gauge();
		info!(channel = %self.channel_id, closed, "hub stopped");
	}

	fn record_gauge(&self) {
		metrics::gauge!("transmuter_hub_connections", "channel" => self.channel_id.to_string())
			.set(self.connections.len() as f64);
	}

	fn register(&mut self, conn: Connection) {
		self.connections.insert(conn.id, conn.outbound);
		self.record_gauge();

		if self.cfg.debug_logs {
			debug!(channel = %self.channel_id, conn = %conn.id, conns = self.connections.len(), "hub: registered");
		}
	}

	fn unregister(&mut self, id: ConnectionId) {
		// Dropping the sender closes the queue, which stops the writer.
		if self.connections.remove(&id).is_some() {
			self.record_gauge();

			if self.cfg.debug_logs {
				debug!(channel = %self.channel_id, conn = %id, conns = self.connections.len(), "hub: unregistered");
			}
		}
	}

	fn publish(&mut self, msg: RelayMessage) {
		let payload = match msg.encode_payload() {
			Ok(p) => Bytes::from(p),
			Err(e) => {
				warn!(channel = %self.channel_id, error = %e, "failed to encode fan-out payload; dropping message");
				return;
			}
		};

		self.fan_out(payload);

		if !msg.is_from_channel() {
			self.hand_to_webhook(msg);
		}
	}

	fn fan_out(&mut self, payload: Bytes) {
		let mut delivered: u64 = 0;
		let mut evicted = Vec::new();

		for (id, tx) in &self.connections {
			match tx.try_send(payload.clone()) {
				Ok(()) => delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => evicted.push((*id, "full")),
				Err(mpsc::error::TrySendError::Closed(_)) => evicted.push((*id, "closed")),
			}
		}

		for (id, reason) in &evicted {
			self.connections.remove(id);
			metrics::counter!("transmuter_hub_evictions_total", "reason" => *reason).increment(1);
			debug!(channel = %self.channel_id, conn = %id, reason, "hub: evicted connection");
		}

		if !evicted.is_empty() {
			self.record_gauge();
		}

		metrics::counter!("transmuter_hub_fanout_total").increment(delivered);

		if self.cfg.debug_logs {
			debug!(
				channel = %self.channel_id,
				delivered,
				evicted = evicted.len(),
				"hub: fan-out complete"
			);
		}
	}

	fn hand_to_webhook(&mut self, msg: RelayMessage) {
		let job = WebhookJob {
			author: msg.author().to_string(),
			content: msg.content().to_string(),
		};

		match self.webhook_tx.try_send(job) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(_)) => {
				self.webhook_dropped = self.webhook_dropped.saturating_add(1);
				metrics::counter!("transmuter_webhook_executions_total", "result" => "dropped").increment(1);
				warn!(
					channel = %self.channel_id,
					dropped = self.webhook_dropped,
					"webhook queue full; dropping socket message"
				);
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				warn!(channel = %self.channel_id, "webhook dispatcher stopped; dropping socket message");
			}
		}
	}
}
