#![forbid(unsafe_code)]

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use transmuter_platform::discord::{DiscordGatewayAdapter, DiscordGatewayConfig, DiscordRestClient};
use transmuter_platform::{AdapterControl, ChannelApi, bounded_adapter_channels};
use transmuter_util::endpoint::BindEndpoint;

use crate::server::connection::ConnectionSettings;
use crate::server::health::HealthState;
use crate::server::http::{HttpSettings, HttpState};
use crate::server::hub::HubConfig;
use crate::server::registry::{HubRegistry, RegistryConfig};
use crate::server::router::{RouterConfig, spawn_platform_router};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: transmuter_server [--bind http://host:port] [--config PATH]\n\
\n\
Options:\n\
\t--bind     Listen address (default: {})\n\
\t          Format: http://host:port\n\
\t--config   Config file (default: ~/.transmuter/config.toml)\n\
\t--help     Show this help\n\
",
		config::DEFAULT_BIND
	);
	std::process::exit(2)
}

struct CliArgs {
	bind: Option<String>,
	config_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs {
		bind: None,
		config_path: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected http://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,transmuter_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("transmuter_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	// `.env` may carry RUST_LOG, so it is read before tracing starts.
	let dotenv = dotenvy::dotenv();
	init_tracing();
	match dotenv {
		Ok(path) => info!(path = %path.display(), "loaded .env"),
		Err(e) if e.not_found() => {}
		Err(e) => warn!(error = %e, "failed to load .env"),
	}

	let args = parse_args();

	let config_path = match args.config_path {
		Some(p) => p,
		None => config::default_config_path()?,
	};
	let cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let Some(bot_token) = cfg.discord.bot_token.clone() else {
		anyhow::bail!("no Discord bot token configured (set TRANSMUTER_DISCORD_BOT_TOKEN or DISCORD_BOT_TOKEN)");
	};

	let bind_raw = args
		.bind
		.or_else(|| cfg.server.bind.clone())
		.unwrap_or_else(|| config::DEFAULT_BIND.to_string());
	let bind = BindEndpoint::parse(&bind_raw).map_err(|e| anyhow::anyhow!(e))?;

	init_metrics(cfg.server.metrics_bind.as_deref());

	let api: Arc<dyn ChannelApi> = Arc::new(
		DiscordRestClient::new(&cfg.discord.api_base_url, bot_token.clone()).context("build discord rest client")?,
	);

	let (control_tx, control_rx, events_tx, events_rx) = bounded_adapter_channels(8, 1024);

	let mut gateway_cfg = DiscordGatewayConfig::new(bot_token);
	gateway_cfg.gateway_url = cfg.discord.gateway_url.clone();
	gateway_cfg.intents = cfg.discord.intents;
	gateway_cfg.reconnect_min_delay = cfg.discord.reconnect_min_delay;
	gateway_cfg.reconnect_max_delay = cfg.discord.reconnect_max_delay;
	let mut adapter_task = tokio::spawn(DiscordGatewayAdapter::new(gateway_cfg).run(control_rx, events_tx));

	let registry = HubRegistry::new(
		Arc::clone(&api),
		RegistryConfig {
			hub: HubConfig {
				command_capacity: cfg.hub.command_capacity,
				debug_logs: cfg.hub.debug_logs,
			},
			webhook_queue_capacity: cfg.hub.webhook_queue_capacity,
			webhook_name: cfg.discord.webhook_name.clone(),
		},
	);
	let router_task = spawn_platform_router(
		registry.clone(),
		events_rx,
		RouterConfig {
			debug_log_events: cfg.hub.debug_logs,
		},
	);

	let settings = HttpSettings::new(
		&cfg.server.allow_origin,
		ConnectionSettings {
			queue_capacity: cfg.server.connection_queue_capacity,
			keepalive_interval: cfg.server.keepalive_interval,
			idle_timeout: cfg.server.idle_timeout,
			max_frame_bytes: cfg.server.max_frame_bytes,
		},
	)?;
	let state = HttpState {
		registry: registry.clone(),
		api,
		settings,
		health: HealthState::new(),
	};

	let listener = TcpListener::bind(bind.hostport())
		.await
		.with_context(|| format!("bind {bind}"))?;
	info!(bind = %bind, "transmuter listening");

	let (stop_tx, stop_rx) = watch::channel(false);
	let server_task = tokio::spawn(crate::server::http::serve(listener, state, stop_rx));

	let adapter_exit = tokio::select! {
		res = tokio::signal::ctrl_c() => {
			res.context("listen for ctrl-c")?;
			info!("shutdown requested");
			None
		}
		res = &mut adapter_task => Some(res),
	};

	let _ = stop_tx.send(true);
	registry.shutdown_all().await;

	let adapter_result = match adapter_exit {
		Some(res) => res,
		None => {
			let _ = control_tx.send(AdapterControl::Shutdown).await;
			adapter_task.await
		}
	};

	let _ = router_task.await;
	match server_task.await {
		Ok(Err(e)) => warn!(error = %e, "http server stopped with error"),
		Err(e) => warn!(error = %e, "http server task failed"),
		Ok(Ok(())) => {}
	}

	match adapter_result {
		Ok(Ok(())) => {
			info!("transmuter stopped");
			Ok(())
		}
		Ok(Err(e)) => {
			error!(error = %e, "discord gateway adapter stopped");
			Err(e)
		}
		Err(e) => Err(anyhow::anyhow!(e).context("discord gateway adapter task")),
	}
}
