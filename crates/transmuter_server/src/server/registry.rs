#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use transmuter_domain::ChannelId;
use transmuter_platform::ChannelApi;

use crate::server::hub::{HubConfig, HubHandle, spawn_hub};
use crate::server::webhook::{WebhookProvisioner, spawn_webhook_dispatcher};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
	pub hub: HubConfig,
	pub webhook_queue_capacity: usize,
	pub webhook_name: String,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			hub: HubConfig::default(),
			webhook_queue_capacity: 256,
			webhook_name: crate::config::DEFAULT_WEBHOOK_NAME.to_string(),
		}
	}
}

/// A running hub and the provisioner bound to the same channel.
#[derive(Debug, Clone)]
pub struct HubEntry {
	pub handle: HubHandle,
	pub provisioner: Arc<WebhookProvisioner>,
}

#[derive(Debug)]
struct Slot {
	entry: HubEntry,
	generation: u64,
	leases: usize,
}

#[derive(Debug, Default)]
struct Inner {
	hubs: HashMap<ChannelId, Slot>,
	next_generation: u64,
	closing: bool,
}

impl Inner {
	fn record_gauge(&self) {
		metrics::gauge!("transmuter_hubs").set(self.hubs.len() as f64);
	}
}

/// One hub per bridged channel, alive while someone holds a lease on it.
///
/// Leases are taken and released under the registry lock, so a channel either
/// reuses the running hub or gets a fresh one; it never registers into a hub that
/// is being reaped.
#[derive(Clone)]
pub struct HubRegistry {
	inner: Arc<Mutex<Inner>>,
	api: Arc<dyn ChannelApi>,
	cfg: RegistryConfig,
}

/// Keeps a channel hub alive. Dropping the last lease removes the hub from the
/// registry; the hub loop then stops once its remaining handles are gone, and the
/// webhook dispatcher finishes any queued posts before it exits.
#[derive(Debug)]
pub struct HubLease {
	inner: Arc<Mutex<Inner>>,
	channel: ChannelId,
	generation: u64,
	entry: HubEntry,
}

impl HubLease {
	pub fn handle(&self) -> &HubHandle {
		&self.entry.handle
	}

	pub fn provisioner(&self) -> &Arc<WebhookProvisioner> {
		&self.entry.provisioner
	}
}

impl Drop for HubLease {
	fn drop(&mut self) {
		let mut inner = self.inner.lock();

		let Some(slot) = inner.hubs.get_mut(&self.channel) else {
			return;
		};
		if slot.generation != self.generation {
			return;
		}

		slot.leases = slot.leases.saturating_sub(1);
		if slot.leases == 0 {
			inner.hubs.remove(&self.channel);
			inner.record_gauge();
			debug!(channel = %self.channel, hubs = inner.hubs.len(), "last lease released; reaping channel hub");
		}
	}
}

impl HubRegistry {
	pub fn new(api: Arc<dyn ChannelApi>, cfg: RegistryConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			api,
			cfg,
		}
	}

	/// Lease the hub for `channel`, spawning it (with its webhook dispatcher) if
	/// needed. `None` once shutdown has begun.
	pub fn acquire(&self, channel: &ChannelId) -> Option<HubLease> {
		let mut inner = self.inner.lock();
		if inner.closing {
			return None;
		}

		if let Some(slot) = inner.hubs.get_mut(channel)
			&& !slot.entry.handle.is_closed()
		{
			slot.leases += 1;
			return Some(HubLease {
				inner: Arc::clone(&self.inner),
				channel: channel.clone(),
				generation: slot.generation,
				entry: slot.entry.clone(),
			});
		}

		let provisioner = Arc::new(WebhookProvisioner::new(
			Arc::clone(&self.api),
			channel.clone(),
			self.cfg.webhook_name.clone(),
		));
		let webhook_tx = spawn_webhook_dispatcher(Arc::clone(&provisioner), self.cfg.webhook_queue_capacity);
		let handle = spawn_hub(channel.clone(), self.cfg.hub.clone(), webhook_tx);
		let entry = HubEntry { handle, provisioner };

		inner.next_generation += 1;
		let generation = inner.next_generation;
		inner.hubs.insert(
			channel.clone(),
			Slot {
				entry: entry.clone(),
				generation,
				leases: 1,
			},
		);
		inner.record_gauge();
		info!(channel = %channel, hubs = inner.hubs.len(), "spawned channel hub");

		Some(HubLease {
			inner: Arc::clone(&self.inner),
			channel: channel.clone(),
			generation,
			entry,
		})
	}

	/// Hub for `channel` if one is running. Never spawns.
	pub fn get(&self, channel: &ChannelId) -> Option<HubEntry> {
		self.inner
			.lock()
			.hubs
			.get(channel)
			.filter(|s| !s.entry.handle.is_closed())
			.map(|s| s.entry.clone())
	}

	#[cfg(test)]
	pub fn hub_count(&self) -> usize {
		self.inner.lock().hubs.len()
	}

	/// Refuse new leases and stop every hub, closing all socket queues.
	pub async fn shutdown_all(&self) {
		let entries: Vec<HubEntry> = {
			let mut inner = self.inner.lock();
			inner.closing = true;
			let entries = inner.hubs.drain().map(|(_, s)| s.entry).collect();
			inner.record_gauge();
			entries
		};
		let count = entries.len();

		for entry in entries {
			entry.handle.shutdown().await;
		}

		info!(hubs = count, "all channel hubs stopped");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::connection::Connection;
	use crate::server::test_support::{MockChannelApi, channel, eventually};
	use transmuter_domain::RelayMessage;

	fn registry(api: Arc<MockChannelApi>) -> HubRegistry {
		HubRegistry::new(api, RegistryConfig::default())
	}

	#[tokio::test]
	async fn leases_share_one_hub_per_channel() {
		let reg = registry(Arc::new(MockChannelApi::default()));

		let a = reg.acquire(&channel("1")).unwrap();
		let b = reg.acquire(&channel("1")).unwrap();
		let _other = reg.acquire(&channel("2")).unwrap();

		assert!(Arc::ptr_eq(a.provisioner(), b.provisioner()));
		assert_eq!(reg.hub_count(), 2);

		drop(a);
		assert!(reg.get(&channel("1")).is_some());
		drop(b);
		assert!(reg.get(&channel("1")).is_none());
		assert_eq!(reg.hub_count(), 1);
	}

	#[tokio::test]
	async fn idle_hubs_are_reaped_after_their_sockets_leave() {
		let reg = registry(Arc::new(MockChannelApi::default()));

		for id in 1..=200u32 {
			let lease = reg.acquire(&channel(&id.to_string())).unwrap();
			let (conn, mut rx) = Connection::new(4);
			let conn_id = conn.id;
			lease.handle().register(conn).await.unwrap();
			lease.handle().unregister(conn_id).await;
			assert!(rx.recv().await.is_none());
		}

		assert_eq!(reg.hub_count(), 0);
	}

	#[tokio::test]
	async fn reaped_hub_still_posts_queued_socket_messages() {
		let api = Arc::new(MockChannelApi::default());
		let reg = registry(Arc::clone(&api));

		let lease = reg.acquire(&channel("1")).unwrap();
		lease.handle().publish(RelayMessage::from_socket("alice", "last words")).await;
		drop(lease);

		assert_eq!(reg.hub_count(), 0);
		assert!(eventually(|| api.executed().len() == 1).await);
		assert_eq!(api.executed()[0].content, "last words");
	}

	#[tokio::test]
	async fn shutdown_refuses_new_leases() {
		let reg = registry(Arc::new(MockChannelApi::default()));

		let old = reg.acquire(&channel("1")).unwrap();
		reg.shutdown_all().await;
		assert!(eventually(|| old.handle().is_closed()).await);

		assert!(reg.acquire(&channel("1")).is_none());
		drop(old);
		assert_eq!(reg.hub_count(), 0);
	}

	#[tokio::test]
	async fn closed_hub_is_replaced_on_next_acquire() {
		let reg = registry(Arc::new(MockChannelApi::default()));

		let first = reg.acquire(&channel("1")).unwrap();
		first.handle().shutdown().await;
		assert!(eventually(|| first.handle().is_closed()).await);
		assert!(reg.get(&channel("1")).is_none());

		let second = reg.acquire(&channel("1")).unwrap();
		assert!(!second.handle().is_closed());
		drop(first);
		assert!(reg.get(&channel("1")).is_some());
	}
}
