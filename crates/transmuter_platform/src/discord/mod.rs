#![forbid(unsafe_code)]

mod adapter;
pub mod gateway;
pub mod rest;

pub use adapter::{DiscordGatewayAdapter, DiscordGatewayConfig, GatewayWs, WsConnector};
pub use gateway::{DEFAULT_GATEWAY_URL, DEFAULT_INTENTS};
pub use rest::{DEFAULT_API_BASE_URL, DiscordRestClient};
