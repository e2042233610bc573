#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, MissedTickBehavior, sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::gateway::{self, opcode};
use crate::{AdapterControl, AdapterControlRx, AdapterEvent, AdapterEventTx, SecretString, new_session_id, status, status_error};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type GatewayWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<GatewayWs>> + Send + Sync>;

/// Discord gateway adapter configuration.
#[derive(Clone)]
pub struct DiscordGatewayConfig {
	pub bot_token: SecretString,
	pub gateway_url: String,
	pub intents: u64,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub hello_timeout: Duration,

	/// Upper bound of the random pause before re-identifying after INVALID_SESSION.
	pub invalid_session_max_delay: Duration,

	pub ws_connector: Option<WsConnector>,
}

impl DiscordGatewayConfig {
	pub fn new(bot_token: SecretString) -> Self {
		Self {
			bot_token,
			gateway_url: gateway::DEFAULT_GATEWAY_URL.to_string(),
			intents: gateway::DEFAULT_INTENTS,
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			hello_timeout: Duration::from_secs(10),
			invalid_session_max_delay: Duration::from_secs(5),
			ws_connector: None,
		}
	}
}

#[derive(Debug, Clone)]
struct ResumeState {
	session_id: String,
	resume_url: Option<String>,
}

/// How a single gateway session ended.
#[derive(Debug)]
enum SessionEnd {
	Shutdown,
	Reconnect { resume: bool },
	Fatal(anyhow::Error),
}

#[derive(Debug, Default)]
struct SessionState {
	awaiting_ack: bool,
	established: bool,
	dropped_events: u64,
}

/// Discord gateway adapter: keeps one gateway session alive and emits message events.
pub struct DiscordGatewayAdapter {
	cfg: DiscordGatewayConfig,
	resume: Option<ResumeState>,
	seq: Option<u64>,
	self_user_id: Option<String>,
}

impl DiscordGatewayAdapter {
	pub fn new(cfg: DiscordGatewayConfig) -> Self {
		Self {
			cfg,
			resume: None,
			seq: None,
			self_user_id: None,
		}
	}

	fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
		let pow = attempt.min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(max).max(min)
	}

	async fn connect_gateway_ws(url: Url) -> anyhow::Result<GatewayWs> {
		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.context("connect_async to discord gateway")?;
		Ok(ws)
	}

	async fn connect_ws(&self, url: Url) -> anyhow::Result<GatewayWs> {
		match &self.cfg.ws_connector {
			Some(connector) => connector(url).await,
			None => Self::connect_gateway_ws(url).await,
		}
	}

	fn session_url(&self) -> anyhow::Result<Url> {
		let raw = match self.resume.as_ref().and_then(|r| r.resume_url.as_deref()) {
			Some(resume) => format!("{}/?v=10&encoding=json", resume.trim_end_matches('/')),
			None => self.cfg.gateway_url.clone(),
		};
		Url::parse(&raw).with_context(|| format!("parse gateway url {raw}"))
	}

	async fn read_until_hello(ws: &mut GatewayWs) -> anyhow::Result<gateway::HelloData> {
		loop {
			let msg = ws.next().await.context("gateway closed before HELLO")??;
			match msg {
				Message::Text(t) => {
					let payload = gateway::parse_payload(t.as_str())?;
					return gateway::parse_hello(payload);
				}
				Message::Ping(p) => {
					let _ = ws.send(Message::Pong(p)).await;
				}
				Message::Close(c) => {
					anyhow::bail!("gateway closed before HELLO: {c:?}");
				}
				_ => {}
			}
		}
	}

	async fn send_heartbeat(&self, ws: &mut GatewayWs) -> anyhow::Result<()> {
		ws.send(Message::text(gateway::heartbeat_payload(self.seq)))
			.await
			.context("send heartbeat")
	}

	/// Run the adapter until shutdown or a fatal gateway error.
	pub async fn run(mut self, mut control_rx: AdapterControlRx, events_tx: AdapterEventTx) -> anyhow::Result<()> {
		let adapter_session_id = new_session_id();
		let _ = events_tx.try_send(status(
			false,
			format!("discord adapter starting (session_id={adapter_session_id})"),
		));
		info!(%adapter_session_id, "discord gateway adapter started");

		let mut reconnect_attempt: u32 = 0;

		loop {
			if reconnect_attempt > 0 {
				let delay = Self::backoff_delay(reconnect_attempt, self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay);
				let _ = events_tx.try_send(status(
					false,
					format!("reconnecting in {delay:?} (attempt={reconnect_attempt})"),
				));

				tokio::select! {
					_ = sleep(delay) => {}
					cmd = control_rx.recv() => {
						match cmd {
							Some(AdapterControl::Shutdown) | None => {
								info!("discord adapter received Shutdown while waiting to reconnect");
								break;
							}
						}
					}
				}
			}

			let url = match self.session_url() {
				Ok(u) => u,
				Err(e) => {
					let _ = events_tx.try_send(status_error("invalid gateway url", &e));
					self.resume = None;
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					continue;
				}
			};

			let ws = match self.connect_ws(url).await {
				Ok(ws) => ws,
				Err(e) => {
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					let _ = events_tx.try_send(status_error("failed to connect discord gateway", e));
					continue;
				}
			};

			let (end, established) = self.run_session(ws, &mut control_rx, &events_tx).await;

			match end {
				SessionEnd::Shutdown => break,
				SessionEnd::Reconnect { resume } => {
					if !resume {
						self.resume = None;
						self.seq = None;
					}
					reconnect_attempt = if established {
						1
					} else {
						reconnect_attempt.saturating_add(1)
					};
				}
				SessionEnd::Fatal(e) => {
					let _ = events_tx.try_send(status_error("discord gateway rejected the session", &e));
					return Err(e);
				}
			}
		}

		let _ = events_tx.try_send(status(false, "discord adapter offline"));
		Ok(())
	}

	async fn run_session(
		&mut self,
		mut ws: GatewayWs,
		control_rx: &mut AdapterControlRx,
		events_tx: &AdapterEventTx,
	) -> (SessionEnd, bool) {
		let hello = tokio::select! {
			res = timeout(self.cfg.hello_timeout, Self::read_until_hello(&mut ws)) => match res {
				Ok(Ok(h)) => h,
				Ok(Err(e)) => {
					let _ = events_tx.try_send(status_error("failed to read gateway HELLO", e));
					return (SessionEnd::Reconnect { resume: true }, false);
				}
				Err(_) => {
					let _ = events_tx.try_send(status(false, "timed out waiting for gateway HELLO"));
					return (SessionEnd::Reconnect { resume: true }, false);
				}
			},

			cmd = control_rx.recv() => match cmd {
				Some(AdapterControl::Shutdown) | None => {
					info!("discord adapter received Shutdown before HELLO");
					let _ = ws.close(None).await;
					return (SessionEnd::Shutdown, false);
				}
			},
		};

		let interval = Duration::from_millis(hello.heartbeat_interval.max(1));

		let opening = match &self.resume {
			Some(r) => gateway::resume_payload(self.cfg.bot_token.expose(), &r.session_id, self.seq),
			None => gateway::identify_payload(self.cfg.bot_token.expose(), self.cfg.intents),
		};
		if let Err(e) = ws.send(Message::text(opening)).await {
			let _ = events_tx.try_send(status_error("failed to send identify/resume", e));
			return (SessionEnd::Reconnect { resume: true }, false);
		}

		// First beat lands at a random point within the interval.
		let first_beat = interval.mul_f64(rand::random::<f64>());
		let mut heartbeat = tokio::time::interval_at(Instant::now() + first_beat, interval);
		heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

		let mut state = SessionState::default();

		loop {
			tokio::select! {
				cmd = control_rx.recv() => {
					match cmd {
						Some(AdapterControl::Shutdown) | None => {
							info!("discord adapter received Shutdown");
							let _ = ws.close(None).await;
							return (SessionEnd::Shutdown, state.established);
						}
					}
				}

				_ = heartbeat.tick() => {
					if state.awaiting_ack {
						warn!("no heartbeat ACK since last beat; treating gateway connection as dead");
						let _ = ws.close(None).await;
						return (SessionEnd::Reconnect { resume: true }, state.established);
					}

					if let Err(e) = self.send_heartbeat(&mut ws).await {
						let _ = events_tx.try_send(status_error("gateway heartbeat failed", e));
						return (SessionEnd::Reconnect { resume: true }, state.established);
					}
					state.awaiting_ack = true;
				}

				msg = ws.next() => {
					let Some(msg) = msg else {
						let _ = events_tx.try_send(status(false, "gateway stream ended"));
						return (SessionEnd::Reconnect { resume: true }, state.established);
					};

					let msg = match msg {
						Ok(m) => m,
						Err(e) => {
							let _ = events_tx.try_send(status_error("gateway read error", e));
							return (SessionEnd::Reconnect { resume: true }, state.established);
						}
					};

					match msg {
						Message::Text(t) => {
							if let Some(end) = self.handle_text(t.as_str(), &mut ws, events_tx, &mut state).await {
								return (end, state.established);
							}
						}

						Message::Ping(p) => {
							let _ = ws.send(Message::Pong(p)).await;
						}

						Message::Close(frame) => {
							let code = frame.as_ref().map(|f| u16::from(f.code));
							let _ = events_tx.try_send(status(false, format!("gateway closed: {frame:?}")));

							return match code {
								Some(code) if gateway::is_fatal_close_code(code) => (
									SessionEnd::Fatal(anyhow::anyhow!("gateway closed with fatal code {code}")),
									state.established,
								),
								Some(code) if gateway::invalidates_session(code) => {
									(SessionEnd::Reconnect { resume: false }, state.established)
								}
								_ => (SessionEnd::Reconnect { resume: true }, state.established),
							};
						}

						_ => {}
					}
				}
			}
		}
	}

	async fn handle_text(
		&mut self,
		raw: &str,
		ws: &mut GatewayWs,
		events_tx: &AdapterEventTx,
		state: &mut SessionState,
	) -> Option<SessionEnd> {
		let payload = match gateway::parse_payload(raw) {
			Ok(p) => p,
			Err(e) => {
				debug!(error = %e, "ignoring unparsable gateway payload");
				return None;
			}
		};

		if let Some(s) = payload.s {
			self.seq = Some(s);
		}

		match payload.op {
			opcode::DISPATCH => {
				let event_name = payload.t?;
				match event_name.as_str() {
					"READY" => match gateway::parse_ready(payload.d) {
						Ok(ready) => {
							info!(user_id = %ready.user.id, username = %ready.user.username, "discord gateway ready");
							let _ = events_tx.try_send(status(
								true,
								format!("gateway ready (user={})", ready.user.username),
							));
							self.self_user_id = Some(ready.user.id);
							self.resume = Some(ResumeState {
								session_id: ready.session_id,
								resume_url: ready.resume_gateway_url,
							});
							state.established = true;
						}
						Err(e) => {
							let _ = events_tx.try_send(status_error("failed to parse READY", e));
							return Some(SessionEnd::Reconnect { resume: false });
						}
					},
					"RESUMED" => {
						let _ = events_tx.try_send(status(true, "gateway session resumed"));
						state.established = true;
					}
					name => match gateway::normalize_dispatch(name, payload.d, self.self_user_id.as_deref()) {
						Ok(Some(ev)) => {
							if events_tx.try_send(AdapterEvent::Message(Box::new(ev))).is_err() {
								state.dropped_events = state.dropped_events.saturating_add(1);
								metrics::counter!("transmuter_gateway_events_dropped_total").increment(1);
								if state.dropped_events.is_power_of_two() {
									warn!(dropped = state.dropped_events, "gateway event queue full; dropping events");
								}
							}
						}
						Ok(None) => {}
						Err(e) => {
							warn!(event = name, error = %e, "failed to normalize gateway dispatch");
						}
					},
				}
			}

			opcode::HEARTBEAT => {
				if let Err(e) = self.send_heartbeat(ws).await {
					let _ = events_tx.try_send(status_error("gateway heartbeat failed", e));
					return Some(SessionEnd::Reconnect { resume: true });
				}
			}

			opcode::RECONNECT => {
				let _ = events_tx.try_send(status(false, "gateway requested reconnect"));
				let _ = ws.close(None).await;
				return Some(SessionEnd::Reconnect { resume: true });
			}

			opcode::INVALID_SESSION => {
				let resumable = payload.d.as_bool().unwrap_or(false);
				let _ = events_tx.try_send(status(false, format!("gateway invalidated session (resumable={resumable})")));
				let _ = ws.close(None).await;
				sleep(self.cfg.invalid_session_max_delay.mul_f64(rand::random_range(0.2..=1.0))).await;
				return Some(SessionEnd::Reconnect { resume: resumable });
			}

			opcode::HEARTBEAT_ACK => {
				state.awaiting_ack = false;
			}

			other => {
				debug!(op = other, "ignoring gateway opcode");
			}
		}

		None
	}
}
