//! C13: context and lifecycle (spec §4.13). `ContextBuilder` validates a
//! raw CLI/config into the immutable [`Context`] the rest of the process
//! runs against; once built, nothing downstream second-guesses it.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::SetupError;
use crate::export::endpoint::Endpoint;
use crate::perf::watcher::{Watcher, WatcherSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Pid(i32),
    WholeSystem,
}

/// Fully validated, immutable configuration for one profiling session.
/// Built once at startup by [`ContextBuilder::build`]; every worker
/// restart re-reads this rather than re-deriving it from raw config.
#[derive(Debug, Clone)]
pub struct Context {
    pub target: Target,
    pub watchers: WatcherSet,
    pub cpus: Vec<i32>,
    pub upload_period: Duration,
    pub endpoint: Endpoint,
    pub runtime_dir: PathBuf,
    pub tags: Vec<(String, String)>,
    pub service: String,
    pub env: Option<String>,
    pub version: Option<String>,
    pub dogstatsd_socket: Option<PathBuf>,
}

pub struct ContextBuilder {
    target: Option<Target>,
    watchers: Vec<Watcher>,
    cpus: Option<Vec<i32>>,
    upload_period: Duration,
    endpoint: Option<Endpoint>,
    runtime_dir: PathBuf,
    tags: Vec<(String, String)>,
    service: Option<String>,
    env: Option<String>,
    version: Option<String>,
    dogstatsd_socket: Option<PathBuf>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        ContextBuilder {
            target: None,
            watchers: Vec::new(),
            cpus: None,
            upload_period: Duration::from_secs(60),
            endpoint: None,
            runtime_dir: PathBuf::from("/var/run/sprofd"),
            tags: Vec::new(),
            service: None,
            env: None,
            version: None,
            dogstatsd_socket: None,
        }
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        ContextBuilder::default()
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn watcher(mut self, watcher: Watcher) -> Self {
        self.watchers.push(watcher);
        self
    }

    pub fn cpus(mut self, cpus: Vec<i32>) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn upload_period(mut self, period: Duration) -> Self {
        self.upload_period = period;
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn runtime_dir(mut self, dir: PathBuf) -> Self {
        self.runtime_dir = dir;
        self
    }

    pub fn tag(mut self, key: String, value: String) -> Self {
        self.tags.push((key, value));
        self
    }

    pub fn service(mut self, service: String) -> Self {
        self.service = Some(service);
        self
    }

    pub fn env(mut self, env: String) -> Self {
        self.env = Some(env);
        self
    }

    pub fn version(mut self, version: String) -> Self {
        self.version = Some(version);
        self
    }

    pub fn dogstatsd_socket(mut self, path: PathBuf) -> Self {
        self.dogstatsd_socket = Some(path);
        self
    }

    pub fn build(self) -> Result<Context, SetupError> {
        let target = self.target.unwrap_or(Target::WholeSystem);
        let endpoint = self
            .endpoint
            .ok_or_else(|| SetupError::Config("no export endpoint configured".to_owned()))?;
        let service = self.service.unwrap_or_else(|| "unnamed-service".to_owned());

        if self.upload_period < Duration::from_secs(1) {
            return Err(SetupError::Config(format!(
                "upload period {:?} is too short (minimum 1s)",
                self.upload_period
            )));
        }

        let cpus = match self.cpus {
            Some(cpus) if !cpus.is_empty() => cpus,
            _ => all_online_cpus(),
        };

        let watchers = WatcherSet::build(self.watchers)?;

        Ok(Context {
            target,
            watchers,
            cpus,
            upload_period: self.upload_period,
            endpoint,
            runtime_dir: self.runtime_dir,
            tags: self.tags,
            service,
            env: self.env,
            version: self.version,
            dogstatsd_socket: self.dogstatsd_socket,
        })
    }
}

fn all_online_cpus() -> Vec<i32> {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n <= 0 {
        vec![0]
    } else {
        (0..n as i32).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_fails_without_an_endpoint() {
        let err = ContextBuilder::new().build().unwrap_err();
        assert!(matches!(err, SetupError::Config(_)));
    }

    #[test]
    fn build_rejects_too_short_an_upload_period() {
        let err = ContextBuilder::new()
            .endpoint(Endpoint::Agent {
                base_url: "http://localhost:8126".to_owned(),
            })
            .upload_period(Duration::from_millis(10))
            .build()
            .unwrap_err();
        assert!(matches!(err, SetupError::Config(_)));
    }

    #[test]
    fn build_defaults_to_whole_system_and_all_cpus() {
        let ctx = ContextBuilder::new()
            .endpoint(Endpoint::Agent {
                base_url: "http://localhost:8126".to_owned(),
            })
            .build()
            .unwrap();
        assert_eq!(ctx.target, Target::WholeSystem);
        assert!(!ctx.cpus.is_empty());
    }

    #[test]
    fn explicit_cpu_list_is_preserved() {
        let ctx = ContextBuilder::new()
            .endpoint(Endpoint::Agent {
                base_url: "http://localhost:8126".to_owned(),
            })
            .cpus(vec![0, 2])
            .build()
            .unwrap();
        assert_eq!(ctx.cpus, vec![0, 2]);
    }
}
