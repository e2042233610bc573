#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hyper::StatusCode;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Status and body for a health path, or `None` if `path` is not one.
pub fn health_response(path: &str, state: &HealthState) -> Option<(StatusCode, &'static str)> {
	match path {
		"/healthz" => Some((StatusCode::OK, "ok")),
		"/readyz" if state.is_ready() => Some((StatusCode::OK, "ready")),
		"/readyz" => Some((StatusCode::SERVICE_UNAVAILABLE, "not-ready")),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn readiness_flips_once_marked() {
		let state = HealthState::new();
		assert_eq!(health_response("/healthz", &state), Some((StatusCode::OK, "ok")));
		assert_eq!(
			health_response("/readyz", &state),
			Some((StatusCode::SERVICE_UNAVAILABLE, "not-ready"))
		);

		state.mark_ready();
		assert_eq!(health_response("/readyz", &state), Some((StatusCode::OK, "ready")));
		assert_eq!(health_response("/metrics", &state), None);
	}
}
