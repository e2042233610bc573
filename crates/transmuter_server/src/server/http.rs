#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tracing::{debug, info, warn};
use transmuter_domain::ChannelId;
use transmuter_platform::{ChannelApi, HistoryQuery, PlatformError};

use crate::server::connection::{ConnectionSettings, serve_socket};
use crate::server::health::{HealthState, health_response};
use crate::server::registry::HubRegistry;

type HttpResponse = Response<Full<Bytes>>;

#[derive(Debug, Clone)]
pub struct HttpSettings {
	/// Sent as `Access-Control-Allow-Origin` on every response.
	pub allow_origin: HeaderValue,
	pub connection: ConnectionSettings,
}

impl HttpSettings {
	pub fn new(allow_origin: &str, connection: ConnectionSettings) -> anyhow::Result<Self> {
		let allow_origin =
			HeaderValue::from_str(allow_origin).with_context(|| format!("invalid allow_origin value {allow_origin:?}"))?;
		Ok(Self {
			allow_origin,
			connection,
		})
	}
}

impl Default for HttpSettings {
	fn default() -> Self {
		Self {
			allow_origin: HeaderValue::from_static("*"),
			connection: ConnectionSettings::default(),
		}
	}
}

/// Everything a request handler needs.
#[derive(Clone)]
pub struct HttpState {
	pub registry: HubRegistry,
	pub api: Arc<dyn ChannelApi>,
	pub settings: HttpSettings,
	pub health: HealthState,
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp.headers_mut().insert(
		header::CONTENT_TYPE,
		HeaderValue::from_static("text/plain; charset=utf-8"),
	);
	resp
}

fn json_response(body: String) -> HttpResponse {
	let mut resp = Response::new(Full::new(Bytes::from(body)));
	resp.headers_mut()
		.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}

/// Accept HTTP connections until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: HttpState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
	let local = listener.local_addr().context("read listener address")?;
	state.health.mark_ready();
	info!(addr = %local, "http server accepting connections");

	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, remote) = match accepted {
					Ok(v) => v,
					Err(e) => {
						warn!(error = %e, "accept failed");
						tokio::time::sleep(Duration::from_millis(50)).await;
						continue;
					}
				};

				let state = state.clone();
				tokio::spawn(async move {
					let io = TokioIo::new(stream);
					let service = service_fn(move |req| handle(req, state.clone()));
					if let Err(err) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
						debug!(%remote, error = %err, "http connection error");
					}
				});
			}

			_ = shutdown.changed() => {
				info!("http server stopping");
				break;
			}
		}
	}

	Ok(())
}

pub async fn handle<B: Send>(mut req: Request<B>, state: HttpState) -> Result<HttpResponse, Infallible> {
	let mut resp = route(&mut req, &state).await;
	resp.headers_mut()
		.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, state.settings.allow_origin.clone());
	Ok(resp)
}

async fn route<B: Send>(req: &mut Request<B>, state: &HttpState) -> HttpResponse {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	if method == Method::OPTIONS {
		let mut resp = response(StatusCode::NO_CONTENT, Bytes::new());
		let headers = resp.headers_mut();
		headers.insert(
			header::ACCESS_CONTROL_ALLOW_METHODS,
			HeaderValue::from_static("GET, POST, OPTIONS"),
		);
		headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("content-type"));
		return resp;
	}

	if let Some((status, body)) = health_response(&path, &state.health) {
		return if method == Method::GET {
			response(status, body)
		} else {
			response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
		};
	}

	let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
	let ["channels", raw_id, action] = segments.as_slice() else {
		return response(StatusCode::NOT_FOUND, "not found");
	};

	let channel = match ChannelId::new(*raw_id) {
		Ok(c) => c,
		Err(e) => return response(StatusCode::BAD_REQUEST, format!("invalid channel id: {e}")),
	};

	match (&method, *action) {
		(&Method::GET, "gateway") => upgrade_socket(req, channel, state),
		(&Method::GET, "messages") => channel_messages(req.uri().query(), &channel, state).await,
		(&Method::POST, "webhook") => webhook_url(&channel, state).await,
		(_, "gateway" | "messages" | "webhook") => response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
		_ => response(StatusCode::NOT_FOUND, "not found"),
	}
}

fn shutting_down() -> HttpResponse {
	response(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
}

fn header_has_token(headers: &hyper::HeaderMap, name: header::HeaderName, token: &str) -> bool {
	headers
		.get_all(name)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn upgrade_socket<B>(req: &mut Request<B>, channel: ChannelId, state: &HttpState) -> HttpResponse {
	let headers = req.headers();
	let wants_upgrade = header_has_token(headers, header::CONNECTION, "upgrade")
		&& header_has_token(headers, header::UPGRADE, "websocket");
	let version_ok = headers
		.get(header::SEC_WEBSOCKET_VERSION)
		.is_some_and(|v| v.as_bytes() == b"13");

	let accept = match (wants_upgrade, version_ok, headers.get(header::SEC_WEBSOCKET_KEY)) {
		(true, true, Some(key)) => derive_accept_key(key.as_bytes()),
		_ => return response(StatusCode::BAD_REQUEST, "expected a websocket upgrade request"),
	};
	let Ok(accept) = HeaderValue::from_str(&accept) else {
		return response(StatusCode::INTERNAL_SERVER_ERROR, "failed to derive accept key");
	};

	let Some(lease) = state.registry.acquire(&channel) else {
		return shutting_down();
	};
	let settings = state.settings.connection.clone();
	let on_upgrade = hyper::upgrade::on(req);

	tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				let ws_config = WebSocketConfig::default()
					.max_message_size(Some(settings.max_frame_bytes))
					.max_frame_size(Some(settings.max_frame_bytes));
				let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, Some(ws_config)).await;
				serve_socket(ws, lease.handle().clone(), settings).await;
			}
			Err(e) => warn!(channel = %channel, error = %e, "websocket upgrade failed"),
		}
	});

	let mut resp = response(StatusCode::SWITCHING_PROTOCOLS, Bytes::new());
	let headers = resp.headers_mut();
	headers.remove(header::CONTENT_TYPE);
	headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
	headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
	headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
	resp
}

/// Parse `limit`, `before` and `after`. A non-numeric limit is an error; numeric
/// limits are clamped to what the platform accepts.
fn parse_history_query(query: Option<&str>) -> Result<HistoryQuery, String> {
	let mut q = HistoryQuery::default();

	for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
		let value = value.trim();
		match key.as_ref() {
			"limit" if !value.is_empty() => {
				let limit: u64 = value.parse().map_err(|_| format!("invalid limit: {value:?}"))?;
				q.limit = limit.clamp(1, 100) as u8;
			}
			"before" if !value.is_empty() => q.before = Some(value.to_string()),
			"after" if !value.is_empty() => q.after = Some(value.to_string()),
			_ => {}
		}
	}

	Ok(q)
}

async fn channel_messages(query: Option<&str>, channel: &ChannelId, state: &HttpState) -> HttpResponse {
	let q = match parse_history_query(query) {
		Ok(q) => q,
		Err(e) => return response(StatusCode::BAD_REQUEST, e),
	};

	match state.api.channel_messages(channel, &q).await {
		Ok(messages) => json_response(messages.to_string()),
		Err(e) => platform_error_response(channel, "fetch channel messages", &e),
	}
}

async fn webhook_url(channel: &ChannelId, state: &HttpState) -> HttpResponse {
	let Some(lease) = state.registry.acquire(channel) else {
		return shutting_down();
	};
	match lease.provisioner().ensure_binding().await {
		Ok(binding) => response(StatusCode::OK, binding.execute_url()),
		Err(e) => platform_error_response(channel, "provision webhook", &e),
	}
}

fn platform_error_response(channel: &ChannelId, what: &str, err: &PlatformError) -> HttpResponse {
	warn!(channel = %channel, error = %err, "failed to {what}");

	match err {
		PlatformError::NotFound(_) => response(StatusCode::NOT_FOUND, format!("channel {channel} not found")),
		PlatformError::RateLimited { retry_after } => {
			let mut resp = response(StatusCode::TOO_MANY_REQUESTS, "rate limited by platform");
			if let Some(delay) = retry_after {
				let secs = delay.as_secs_f64().ceil() as u64;
				resp.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
			}
			resp
		}
		_ => response(StatusCode::BAD_GATEWAY, format!("failed to {what}: {err}")),
	}
}
