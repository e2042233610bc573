#![forbid(unsafe_code)]

pub mod endpoint {
	use std::fmt;

	const SCHEMES: [&str; 2] = ["http://", "ws://"];

	/// Listen address given as `http://host:port`, `ws://host:port` or bare `host:port`.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct BindEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl BindEndpoint {
		/// Returns `host:port` suitable for `TcpListener::bind` (IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("bind address must be non-empty (expected http://host:port)".to_string());
			}

			let rest = SCHEMES.iter().find_map(|scheme| s.strip_prefix(scheme)).unwrap_or(s);

			if rest.contains("://") {
				return Err(format!("unsupported bind scheme (expected http:// or ws://): {s}"));
			}

			// A single trailing slash is what most people paste from a browser.
			let rest = rest.strip_suffix('/').unwrap_or(rest);
			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("bind address must not carry a path, query or fragment: {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("bind address is missing :port (expected http://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("bind address host is empty (use 0.0.0.0 to listen on all interfaces): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("IPv6 bind hosts must be bracketed like http://[::1]:3000: {s}"));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid bind port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid bind port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	impl fmt::Display for BindEndpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			write!(f, "http://{}", self.hostport())
		}
	}

}
