#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, info, warn};
use transmuter_domain::{ConnectionId, RelayMessage};

use crate::server::hub::HubHandle;

/// Per-socket settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Outbound queue depth before the hub evicts the socket.
	pub queue_capacity: usize,

	pub keepalive_interval: Duration,

	/// Longest silence (no frame, no pong) tolerated from the client.
	pub idle_timeout: Duration,

	pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			queue_capacity: 256,
			keepalive_interval: Duration::from_secs(30),
			idle_timeout: Duration::from_secs(90),
			max_frame_bytes: 64 * 1024,
		}
	}
}

/// Hub-side half of a socket: its identity and the producer end of its outbound queue.
#[derive(Debug)]
pub struct Connection {
	pub id: ConnectionId,
	pub outbound: mpsc::Sender<Bytes>,
}

pub type OutboundQueue = mpsc::Receiver<Bytes>;

impl Connection {
	pub fn new(capacity: usize) -> (Self, OutboundQueue) {
		let (outbound, rx) = mpsc::channel(capacity.max(1));
		(
			Self {
				id: ConnectionId::new_v4(),
				outbound,
			},
			rx,
		)
	}
}

/// Serve one upgraded socket until the client leaves or the hub drops it.
pub async fn serve_socket<S>(ws: WebSocketStream<S>, hub: HubHandle, settings: ConnectionSettings)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (conn, outbound_rx) = Connection::new(settings.queue_capacity);
	let conn_id = conn.id;

	if let Err(e) = hub.register(conn).await {
		warn!(conn = %conn_id, error = %e, "could not register socket");
		return;
	}

	metrics::counter!("transmuter_connections_total").increment(1);
	info!(channel = %hub.channel_id(), conn = %conn_id, "socket connected");

	let (sink, stream) = ws.split();
	let writer = tokio::spawn(write_loop(sink, outbound_rx, settings.keepalive_interval, conn_id));

	read_loop(stream, &hub, conn_id, settings.idle_timeout).await;

	hub.unregister(conn_id).await;
	let _ = writer.await;

	info!(channel = %hub.channel_id(), conn = %conn_id, "socket disconnected");
}

fn frame_for(payload: Bytes) -> Message {
	match Utf8Bytes::try_from(payload.clone()) {
		Ok(text) => Message::Text(text),
		Err(_) => Message::Binary(payload),
	}
}

/// Drain the outbound queue to the socket and keep it alive with pings.
///
/// Ends when the queue closes (unregistered, evicted, hub stopped) or a write fails.
async fn write_loop<S>(
	mut sink: SplitSink<WebSocketStream<S>, Message>,
	mut outbound_rx: OutboundQueue,
	keepalive: Duration,
	conn_id: ConnectionId,
) where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut ping = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
	ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			item = outbound_rx.recv() => {
				let Some(payload) = item else {
					debug!(conn = %conn_id, "outbound queue closed; closing socket");
					let _ = sink.send(Message::Close(None)).await;
					break;
				};

				if let Err(e) = sink.send(frame_for(payload)).await {
					debug!(conn = %conn_id, error = %e, "socket write failed");
					break;
				}
			}

			_ = ping.tick() => {
				if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
					debug!(conn = %conn_id, error = %e, "keepalive ping failed");
					break;
				}
			}
		}
	}

	let _ = sink.close().await;
}

async fn read_loop<S>(
	mut stream: SplitStream<WebSocketStream<S>>,
	hub: &HubHandle,
	conn_id: ConnectionId,
	idle_timeout: Duration,
) where
	S: AsyncRead + AsyncWrite + Unpin,
{
	loop {
		let next = match timeout(idle_timeout, stream.next()).await {
			Ok(next) => next,
			Err(_) => {
				debug!(conn = %conn_id, "socket idle past timeout");
				break;
			}
		};

		let msg = match next {
			None => break,
			Some(Ok(m)) => m,
			Some(Err(e)) => {
				debug!(conn = %conn_id, error = %e, "socket read failed");
				break;
			}
		};

		let raw = match &msg {
			Message::Text(t) => t.as_str(),
			Message::Binary(b) => match std::str::from_utf8(b) {
				Ok(s) => s,
				Err(_) => {
					reject(conn_id, "binary_not_utf8", "binary frame is not valid UTF-8");
					continue;
				}
			},
			Message::Close(_) => break,
			_ => continue,
		};

		match RelayMessage::from_client_frame(raw) {
			Ok(relay) => hub.publish(relay).await,
			Err(e) => reject(conn_id, e.reason(), &e.to_string()),
		}
	}
}

fn reject(conn_id: ConnectionId, reason: &'static str, detail: &str) {
	metrics::counter!("transmuter_client_frames_rejected_total", "reason" => reason).increment(1);
	warn!(conn = %conn_id, reason, detail, "dropping invalid client frame");
}
