// Application configuration, loaded from environment variables and CLI flags.

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::arena::DisplaySize;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port for participant connections. 0 lets the OS pick one.
    pub session_port: u16,
    /// Port to bind the host console HTTP server to.
    pub port: u16,
    /// Interval between heartbeat bytes while accepting.
    pub heartbeat: Duration,
    /// Presentation surface the arena is laid out for.
    pub display: DisplaySize,
    /// Where loaded sources are written, one fresh directory per load.
    pub artifact_dir: Option<PathBuf>,
    /// Fixed RNG seed for reproducible matches.
    pub match_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            session_port: 0,
            port: 3000,
            heartbeat: Duration::from_millis(500),
            display: DisplaySize {
                width: 1920,
                height: 1080,
            },
            artifact_dir: None,
            match_seed: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `SESSION_PORT` - participant TCP port (default: 0, auto-assigned)
    /// - `PORT` - host console port (default: 3000)
    /// - `HEARTBEAT_MS` - heartbeat interval (default: 500)
    /// - `DISPLAY_WIDTH` / `DISPLAY_HEIGHT` - arena display size (default: 1920x1080)
    /// - `ARTIFACT_DIR` - directory for loaded sources (default: unset)
    /// - `MATCH_SEED` - arena RNG seed (default: unset)
    ///
    /// CLI flags `--session-port <PORT>` and `--port <PORT>` override the env vars.
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_sources(&args, |key| std::env::var(key).ok())
    }

    /// Build a config from CLI args and an environment lookup.
    pub fn from_sources(args: &[String], env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let env_parse = |key: &str| env(key).and_then(|v| v.parse::<u64>().ok());

        // CLI flag takes precedence, then env var, then default
        let session_port = Self::parse_cli_value(args, "--session-port")
            .and_then(|v| v.parse().ok())
            .or_else(|| env("SESSION_PORT").and_then(|v| v.parse().ok()))
            .unwrap_or(defaults.session_port);

        let port = Self::parse_cli_value(args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| env("PORT").and_then(|v| v.parse().ok()))
            .unwrap_or(defaults.port);

        let heartbeat = env_parse("HEARTBEAT_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.heartbeat);

        let display = DisplaySize {
            width: env_parse("DISPLAY_WIDTH")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.display.width),
            height: env_parse("DISPLAY_HEIGHT")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.display.height),
        };

        let artifact_dir = env("ARTIFACT_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Config {
            session_port,
            port,
            heartbeat,
            display,
            artifact_dir,
            match_seed: env_parse("MATCH_SEED"),
        }
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
