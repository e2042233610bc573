#![forbid(unsafe_code)]

pub mod connection;
pub mod health;
pub mod http;
pub mod hub;
pub mod registry;
pub mod router;
pub mod webhook;

#[cfg(test)]
mod test_support;




#[cfg(test)]
mod ws_smoke_tests;
