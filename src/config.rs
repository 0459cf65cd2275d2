// Application configuration, loaded from environment variables and CLI flags.

use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind_addr: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Deadline for one inference call.
    pub inference_timeout: Duration,
    /// Sessions unused for this long are evicted.
    pub session_ttl: Duration,
    /// How often the idle-session sweeper runs.
    pub sweep_interval: Duration,
    /// Context updates allowed per session per minute (0 disables).
    pub rate_limit_per_minute: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0".to_string(),
            port: 3000,
            inference_timeout: Duration::from_millis(30_000),
            session_ttl: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(60),
            rate_limit_per_minute: 120,
        }
    }
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `BIND_ADDR` - interface to listen on (default: `0.0.0.0`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `INFERENCE_TIMEOUT_MS` - inference deadline (default: 30000)
    /// - `SESSION_TTL_SECS` - idle session lifetime (default: 1800)
    /// - `SESSION_SWEEP_SECS` - sweeper interval (default: 60)
    /// - `RATE_LIMIT_PER_MINUTE` - per-session update limit (default: 120, 0 disables)
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    /// - `--bind <ADDR>` - Override the bind address
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_sources(&args, |key| std::env::var(key).ok())
    }

    /// Build a config from CLI args and an environment lookup. CLI flags take
    /// precedence over environment variables, which take precedence over defaults.
    pub fn from_sources(args: &[String], env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();

        let bind_addr = Self::parse_cli_value(args, "--bind")
            .or_else(|| env("BIND_ADDR"))
            .unwrap_or(defaults.bind_addr);

        let port = Self::parse_cli_value(args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| env("PORT").and_then(|v| v.parse().ok()))
            .unwrap_or(defaults.port);

        let inference_timeout = env("INFERENCE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.inference_timeout);

        let session_ttl = env("SESSION_TTL_SECS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.session_ttl);

        let sweep_interval = env("SESSION_SWEEP_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);

        let rate_limit_per_minute = env("RATE_LIMIT_PER_MINUTE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.rate_limit_per_minute);

        Config {
            bind_addr,
            port,
            inference_timeout,
            session_ttl,
            sweep_interval,
            rate_limit_per_minute,
        }
    }

    /// `host:port` for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = Config::from_sources(&args(&["statebridge"]), |_| None);
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:3000");
    }

    #[test]
    fn test_env_values() {
        let env: HashMap<&str, &str> = [
            ("PORT", "8999"),
            ("INFERENCE_TIMEOUT_MS", "1500"),
            ("SESSION_TTL_SECS", "60"),
            ("RATE_LIMIT_PER_MINUTE", "0"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_sources(&[], |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.port, 8999);
        assert_eq!(config.inference_timeout, Duration::from_millis(1500));
        assert_eq!(config.session_ttl, Duration::from_secs(60));
        assert_eq!(config.rate_limit_per_minute, 0);
    }

    #[test]
    fn test_cli_overrides_env() {
        let config = Config::from_sources(
            &args(&["statebridge", "--port", "4000", "--bind", "127.0.0.1"]),
            |k| (k == "PORT").then(|| "5000".to_string()),
        );
        assert_eq!(config.port, 4000);
        assert_eq!(config.listen_addr(), "127.0.0.1:4000");
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = Config::from_sources(&[], |k| match k {
            "PORT" => Some("not-a-port".to_string()),
            "SESSION_SWEEP_SECS" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.port, 3000);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }
}
