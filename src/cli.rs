//! A.3: CLI and configuration (SPEC_FULL §A.3). Mirrors the Datadog
//! profiler's own ambient configuration surface: a handful of explicit
//! flags for standalone/debug use, with `DD_*` environment variables as
//! the primary configuration channel used by library mode (where no
//! command line is available at all).

use std::env;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "sprofd", about = "Linux sampling profiler shipping pprof to an ingestion endpoint")]
pub struct Args {
    /// Profile a single pid instead of the whole system.
    #[arg(long)]
    pub pid: Option<i32>,

    /// Run as a standalone daemon (double-fork + detach) rather than
    /// staying attached to the launching terminal.
    #[arg(long)]
    pub daemonize: bool,

    /// Path to the library-mode handoff socket. When set, the process
    /// serves handoff requests instead of immediately profiling.
    #[arg(long)]
    pub handoff_socket: Option<std::path::PathBuf>,

    /// Restrict sampling to these CPUs (comma-separated); defaults to
    /// every online CPU.
    #[arg(long, value_delimiter = ',')]
    pub cpu: Vec<i32>,

    /// How often to export a profile and reset the in-memory aggregation.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s")]
    pub upload_period: Duration,

    /// Upload through a local trace agent at this base URL instead of
    /// the agentless intake.
    #[arg(long)]
    pub agent_url: Option<String>,

    #[arg(long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// The subset of `DD_*` environment variables this profiler reads
/// directly (spec §A.3), separate from whatever `clap` parsed off
/// `argv` — library mode has no argv to speak of, only environment.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub service: Option<String>,
    pub env: Option<String>,
    pub version: Option<String>,
    pub tags: Vec<(String, String)>,
    pub trace_agent_url: Option<String>,
    pub agent_host: Option<String>,
    pub agent_port: Option<u16>,
    pub api_key: Option<String>,
    pub upload_period: Option<Duration>,
    pub native_socket: Option<std::path::PathBuf>,
    /// Unix datagram socket to emit statsd gauges of this profiler's own
    /// counters to (spec §A.1), e.g. the ambient dogstatsd agent socket.
    pub dogstatsd_socket: Option<std::path::PathBuf>,
}

/// Guard against a profiled process re-exec'ing itself into the
/// profiler binary (or a library-mode client being loaded twice into
/// the same process) recursively spawning profilers of themselves.
pub const REENTRANCY_GUARD_VAR: &str = "DD_PROFILING_NATIVE_LIBRARY_ACTIVE";

pub fn already_active() -> bool {
    env::var_os(REENTRANCY_GUARD_VAR).is_some()
}

pub fn env_overrides() -> EnvOverrides {
    EnvOverrides {
        service: env::var("DD_SERVICE").ok(),
        env: env::var("DD_ENV").ok(),
        version: env::var("DD_VERSION").ok(),
        tags: env::var("DD_TAGS").ok().map(parse_tags).unwrap_or_default(),
        trace_agent_url: env::var("DD_TRACE_AGENT_URL").ok(),
        agent_host: env::var("DD_AGENT_HOST").ok(),
        agent_port: env::var("DD_TRACE_AGENT_PORT").ok().and_then(|s| s.parse().ok()),
        api_key: env::var("DD_API_KEY").ok(),
        upload_period: env::var("DD_PROFILING_UPLOAD_PERIOD")
            .ok()
            .and_then(|s| humantime::parse_duration(&s).ok()),
        native_socket: env::var_os("DD_PROFILING_NATIVE_SOCKET").map(std::path::PathBuf::from),
        dogstatsd_socket: env::var_os("DD_DOGSTATSD_SOCKET").map(std::path::PathBuf::from),
    }
}

/// `DD_TAGS` is a comma-separated list of `key:value` pairs; entries
/// without a `:` are dropped rather than treated as a fatal
/// configuration error, matching how the rest of the Datadog tracing
/// stack tolerates malformed tag strings.
fn parse_tags(raw: String) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| pair.split_once(':'))
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .collect()
}

/// Resolves the effective agent base URL from the three places it can
/// come from, in priority order: explicit CLI flag, `DD_TRACE_AGENT_URL`,
/// then `DD_AGENT_HOST`/`DD_TRACE_AGENT_PORT` assembled into a URL.
pub fn resolve_agent_url(cli: &Args, env: &EnvOverrides) -> Option<String> {
    if let Some(url) = &cli.agent_url {
        return Some(url.clone());
    }
    if let Some(url) = &env.trace_agent_url {
        return Some(url.clone());
    }
    if let Some(host) = &env.agent_host {
        let port = env.agent_port.unwrap_or(8126);
        return Some(format!("http://{host}:{port}"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tags_drops_malformed_entries() {
        let tags = parse_tags("service:demo, bad-entry ,team:infra".to_owned());
        assert_eq!(
            tags,
            vec![("service".to_owned(), "demo".to_owned()), ("team".to_owned(), "infra".to_owned())]
        );
    }

    #[test]
    fn resolve_agent_url_prefers_explicit_cli_flag() {
        let cli = Args {
            pid: None,
            daemonize: false,
            handoff_socket: None,
            cpu: vec![],
            upload_period: Duration::from_secs(60),
            agent_url: Some("http://explicit:8126".to_owned()),
            verbose: 0,
        };
        let env = EnvOverrides {
            trace_agent_url: Some("http://from-env:8126".to_owned()),
            ..Default::default()
        };
        assert_eq!(resolve_agent_url(&cli, &env).as_deref(), Some("http://explicit:8126"));
    }

    #[test]
    fn resolve_agent_url_assembles_host_and_port() {
        let cli = Args {
            pid: None,
            daemonize: false,
            handoff_socket: None,
            cpu: vec![],
            upload_period: Duration::from_secs(60),
            agent_url: None,
            verbose: 0,
        };
        let env = EnvOverrides {
            agent_host: Some("datadog-agent".to_owned()),
            agent_port: Some(9126),
            ..Default::default()
        };
        assert_eq!(
            resolve_agent_url(&cli, &env).as_deref(),
            Some("http://datadog-agent:9126")
        );
    }
}
