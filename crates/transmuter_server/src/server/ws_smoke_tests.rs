#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use transmuter_domain::{RelayKind, RelayMessage};

use crate::server::health::HealthState;
use crate::server::http::{HttpSettings, HttpState, serve};
use crate::server::registry::{HubRegistry, RegistryConfig};
use crate::server::test_support::{MockChannelApi, channel, eventually};

type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
	addr: SocketAddr,
	registry: HubRegistry,
	_stop: watch::Sender<bool>,
}

async fn start_server(api: Arc<MockChannelApi>) -> TestServer {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let registry = HubRegistry::new(api.clone(), RegistryConfig::default());
	let state = HttpState {
		registry: registry.clone(),
		api,
		settings: HttpSettings::default(),
		health: HealthState::new(),
	};

	let (stop_tx, stop_rx) = watch::channel(false);
	tokio::spawn(serve(listener, state, stop_rx));

	TestServer {
		addr,
		registry,
		_stop: stop_tx,
	}
}

async fn open_socket(addr: SocketAddr, channel_id: &str) -> ClientWs {
	let (ws, resp) = connect_async(format!("ws://{addr}/channels/{channel_id}/gateway"))
		.await
		.expect("websocket handshake");
	assert_eq!(resp.status().as_u16(), 101);
	ws
}

async fn next_json(ws: &mut ClientWs) -> serde_json::Value {
	loop {
		let msg = timeout(Duration::from_secs(1), ws.next())
			.await
			.expect("frame within timeout")
			.expect("socket open")
			.expect("frame ok");
		match msg {
			Message::Text(t) => return serde_json::from_str(t.as_str()).expect("json frame"),
			Message::Ping(_) | Message::Pong(_) => continue,
			other => panic!("unexpected frame: {other:?}"),
		}
	}
}

async fn wait_for_connections(server: &TestServer, channel_id: &str, expected: usize) {
	for _ in 0..100 {
		if let Some(entry) = server.registry.get(&channel(channel_id))
			&& entry.handle.connection_count().await == Some(expected)
		{
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("channel {channel_id} never reached {expected} connections");
}

#[tokio::test]
async fn socket_message_reaches_all_sockets_and_the_channel() {
	let api = Arc::new(MockChannelApi::default());
	let server = start_server(Arc::clone(&api)).await;

	let mut a = open_socket(server.addr, "123").await;
	let mut b = open_socket(server.addr, "123").await;
	wait_for_connections(&server, "123", 2).await;

	a.send(Message::text(r#"{"author":"alice","content":"hi","channelID":"123"}"#))
		.await
		.unwrap();

	for ws in [&mut a, &mut b] {
		assert_eq!(
			next_json(ws).await,
			json!({"author": "alice", "content": "hi", "channelID": ""})
		);
	}

	assert!(eventually(|| api.executed().len() == 1).await);
	assert_eq!(api.executed()[0].username, "alice");
}

#[tokio::test]
async fn channel_message_reaches_sockets_only() {
	let api = Arc::new(MockChannelApi::default());
	let server = start_server(Arc::clone(&api)).await;

	let mut a = open_socket(server.addr, "123").await;
	let mut b = open_socket(server.addr, "123").await;
	wait_for_connections(&server, "123", 2).await;

	let entry = server.registry.get(&channel("123")).unwrap();
	entry
		.handle
		.publish(RelayMessage::from_platform(
			&channel("123"),
			RelayKind::Create,
			"Bob",
			"from discord",
			None,
		))
		.await;

	for ws in [&mut a, &mut b] {
		let payload = next_json(ws).await;
		assert_eq!(payload["author"], "Bob");
		assert_eq!(payload["channelID"], "123");
	}

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(api.executed().is_empty());
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_closing_the_socket() {
	let api = Arc::new(MockChannelApi::default());
	let server = start_server(Arc::clone(&api)).await;

	let mut a = open_socket(server.addr, "123").await;
	wait_for_connections(&server, "123", 1).await;

	a.send(Message::text("not json")).await.unwrap();
	a.send(Message::text(r#"{"author":"","content":"x"}"#)).await.unwrap();
	a.send(Message::text(r#"{"author":"alice","content":"still here"}"#))
		.await
		.unwrap();

	assert_eq!(next_json(&mut a).await["content"], "still here");
	assert!(eventually(|| api.executed().len() == 1).await);
}

#[tokio::test]
async fn closing_a_socket_unregisters_it() {
	let api = Arc::new(MockChannelApi::default());
	let server = start_server(api).await;

	let mut a = open_socket(server.addr, "123").await;
	let mut b = open_socket(server.addr, "123").await;
	wait_for_connections(&server, "123", 2).await;

	a.close(None).await.unwrap();
	wait_for_connections(&server, "123", 1).await;

	b.close(None).await.unwrap();
	assert!(eventually(|| server.registry.hub_count() == 0).await);
}

#[tokio::test]
async fn routes_refuse_new_hubs_once_shutdown_begins() {
	let api = Arc::new(MockChannelApi::default());
	let server = start_server(Arc::clone(&api)).await;
	let base = format!("http://{}", server.addr);

	server.registry.shutdown_all().await;

	let resp = reqwest::Client::new()
		.post(format!("{base}/channels/123/webhook"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status().as_u16(), 503);

	match connect_async(format!("ws://{}/channels/123/gateway", server.addr)).await {
		Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => assert_eq!(resp.status().as_u16(), 503),
		Err(other) => panic!("expected http error, got {other:?}"),
		Ok(_) => panic!("upgrade accepted during shutdown"),
	}

	assert_eq!(server.registry.hub_count(), 0);
	assert_eq!(api.lists(), 0);
}

#[tokio::test]
async fn http_routes_behave() {
	let api = Arc::new(MockChannelApi {
		history: json!([{"id": "1", "content": "old"}]),
		..MockChannelApi::default()
	});
	let server = start_server(Arc::clone(&api)).await;
	let base = format!("http://{}", server.addr);
	let http = reqwest::Client::new();

	let resp = http.get(format!("{base}/healthz")).send().await.unwrap();
	assert_eq!(resp.status().as_u16(), 200);
	assert_eq!(
		resp.headers().get("access-control-allow-origin").unwrap().to_str().unwrap(),
		"*"
	);
	assert_eq!(resp.text().await.unwrap(), "ok");

	let resp = http.get(format!("{base}/readyz")).send().await.unwrap();
	assert_eq!(resp.status().as_u16(), 200);

	let resp = http
		.get(format!("{base}/channels/123/messages?limit=5&after=10"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status().as_u16(), 200);
	let body: serde_json::Value = resp.json().await.unwrap();
	assert_eq!(body, json!([{"id": "1", "content": "old"}]));
	{
		let queries = api.history_queries.lock();
		assert_eq!(queries[0].limit, 5);
		assert_eq!(queries[0].after.as_deref(), Some("10"));
	}

	let resp = http
		.get(format!("{base}/channels/123/messages?limit=lots"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status().as_u16(), 400);

	let resp = http.get(format!("{base}/channels/abc/messages")).send().await.unwrap();
	assert_eq!(resp.status().as_u16(), 400);

	for _ in 0..2 {
		let resp = http.post(format!("{base}/channels/123/webhook")).send().await.unwrap();
		assert_eq!(resp.status().as_u16(), 200);
		assert_eq!(
			resp.text().await.unwrap(),
			"https://discord.com/api/webhooks/created-1/created-token?wait=true"
		);
	}
	assert_eq!(api.creates(), 1);

	let resp = http
		.request(reqwest::Method::OPTIONS, format!("{base}/channels/123/messages"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status().as_u16(), 204);

	let resp = http.get(format!("{base}/channels/123/gateway")).send().await.unwrap();
	assert_eq!(resp.status().as_u16(), 400);

	let resp = http.delete(format!("{base}/channels/123/webhook")).send().await.unwrap();
	assert_eq!(resp.status().as_u16(), 405);

	let resp = http.get(format!("{base}/nope")).send().await.unwrap();
	assert_eq!(resp.status().as_u16(), 404);
}
