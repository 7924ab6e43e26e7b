//! # Configuration
//!
//! YAML configuration file. Every section and field is optional, missing
//! ones take their default value.

use std::{fs::read_to_string, path::Path, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::{
    core::{
        events::{ConsumerConfig, OverflowPolicy},
        probe::{
            simulated::SimulatedRegistry, ArtifactSource, HookRegistry, NoArtifacts, ProbeDescriptor,
        },
    },
    sink::{LogFormat, LogSink, MetricsSink, Sink},
};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    pub(crate) channel: ChannelSection,
    pub(crate) consumer: ConsumerSection,
    pub(crate) backend: BackendSection,
    pub(crate) sinks: SinksSection,
    pub(crate) probes: Vec<ProbeDescriptor>,
}

impl Config {
    /// Load a configuration file.
    pub(crate) fn load(path: &Path) -> Result<Config> {
        let contents = read_to_string(path)
            .map_err(|e| anyhow!("Could not read {}: {e}", path.display()))?;
        Config::from_yaml(&contents)
            .map_err(|e| anyhow!("Invalid configuration {}: {e}", path.display()))
    }

    pub(crate) fn from_yaml(contents: &str) -> Result<Config> {
        if contents.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ChannelSection {
    /// Number of records the channel holds, must be a power of two.
    pub(crate) capacity: usize,
    pub(crate) policy: OverflowPolicy,
}

impl Default for ChannelSection {
    fn default() -> Self {
        ChannelSection {
            capacity: 4096,
            policy: OverflowPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ConsumerSection {
    pub(crate) poll_interval_ms: u64,
    pub(crate) batch_size: usize,
    pub(crate) final_drain_max: usize,
    pub(crate) error_log_interval_ms: u64,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        let config = ConsumerConfig::default();
        ConsumerSection {
            poll_interval_ms: config.poll_interval.as_millis() as u64,
            batch_size: config.batch_size,
            final_drain_max: config.final_drain_max,
            error_log_interval_ms: config.error_log_interval.as_millis() as u64,
        }
    }
}

impl ConsumerSection {
    pub(crate) fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
            final_drain_max: self.final_drain_max,
            error_log_interval: Duration::from_millis(self.error_log_interval_ms),
        }
    }
}

/// Host environment the probes are attached to.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum BackendSection {
    Simulated(SimulatedSection),
    Bpf(BpfSection),
}

impl Default for BackendSection {
    fn default() -> Self {
        BackendSection::Simulated(SimulatedSection::default())
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct SimulatedSection {
    pub(crate) hooks: Vec<String>,
    /// Events generated per second and probe.
    pub(crate) rate_hz: u32,
    /// Probes the simulated host refuses to attach.
    pub(crate) reject: Vec<String>,
}

impl Default for SimulatedSection {
    fn default() -> Self {
        SimulatedSection {
            hooks: vec!["xdp".to_string(), "dummy".to_string()],
            rate_hz: 10,
            reject: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BpfSection {
    /// Directory holding the `<probe id>.o` objects.
    pub(crate) artifacts: PathBuf,
}

impl BackendSection {
    /// Instantiate the host registry and its program source.
    pub(crate) fn build(&self) -> Result<(Box<dyn HookRegistry>, Box<dyn ArtifactSource>)> {
        Ok(match self {
            BackendSection::Simulated(sim) => (
                Box::new(SimulatedRegistry::new(&sim.hooks, sim.rate_hz, &sim.reject)?),
                Box::new(NoArtifacts),
            ),
            #[cfg(feature = "bpf")]
            BackendSection::Bpf(bpf) => (
                Box::new(crate::core::probe::bpf::BpfRegistry::new()?),
                Box::new(crate::core::probe::ArtifactDir(bpf.artifacts.clone())),
            ),
            #[cfg(not(feature = "bpf"))]
            BackendSection::Bpf(_) => {
                anyhow::bail!("BPF backend not available, hookwire was built without the 'bpf' feature")
            }
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct SinksSection {
    pub(crate) log: LogSection,
    pub(crate) metrics: MetricsSection,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct LogSection {
    pub(crate) enabled: bool,
    pub(crate) format: LogFormat,
    /// Events are written to stdout if not set.
    pub(crate) path: Option<PathBuf>,
}

impl Default for LogSection {
    fn default() -> Self {
        LogSection {
            enabled: true,
            format: LogFormat::default(),
            path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct MetricsSection {
    pub(crate) enabled: bool,
    /// Also log the metrics summary at this interval.
    pub(crate) report_interval_secs: Option<u64>,
}

impl Default for MetricsSection {
    fn default() -> Self {
        MetricsSection {
            enabled: true,
            report_interval_secs: None,
        }
    }
}

impl SinksSection {
    pub(crate) fn build(&self) -> Result<Vec<Box<dyn Sink>>> {
        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();

        if self.log.enabled {
            sinks.push(Box::new(match &self.log.path {
                Some(path) => LogSink::file(path, self.log.format)?,
                None => LogSink::stdout(self.log.format),
            }));
        }

        if self.metrics.enabled {
            sinks.push(Box::new(MetricsSink::new(
                self.metrics.report_interval_secs.map(Duration::from_secs),
            )));
        }

        Ok(sinks)
    }
}

#[cfg(test)]
mod tests {
    use events::ProbeKind;

    use super::*;

    #[test]
    fn defaults() {
        for contents in ["", "{}", "channel: {}\n"] {
            let config = Config::from_yaml(contents).unwrap();

            assert_eq!(config.channel.capacity, 4096);
            assert_eq!(config.channel.policy, OverflowPolicy::DropNewest);

            let consumer = config.consumer.consumer_config();
            assert_eq!(consumer.poll_interval, Duration::from_millis(100));
            assert_eq!(consumer.batch_size, 256);
            assert_eq!(consumer.final_drain_max, 8192);

            match &config.backend {
                BackendSection::Simulated(sim) => {
                    assert_eq!(sim.hooks, vec!["xdp", "dummy"]);
                    assert_eq!(sim.rate_hz, 10);
                }
                _ => panic!("unexpected default backend"),
            }

            assert!(config.sinks.log.enabled);
            assert_eq!(config.sinks.log.format, LogFormat::Text);
            assert!(config.sinks.log.path.is_none());
            assert!(config.sinks.metrics.enabled);
            assert!(config.probes.is_empty());
        }
    }

    #[test]
    fn full() {
        let config = Config::from_yaml(
            r#"
channel:
  capacity: 1024
  policy: overwrite-oldest
consumer:
  poll_interval_ms: 10
  final_drain_max: 100
backend:
  type: bpf
  artifacts: /usr/lib/hookwire
sinks:
  log:
    format: json
    path: /tmp/events.json
  metrics:
    enabled: false
probes:
  - id: fentry_xdp
    hook: xdp_prog
    kind: entry
  - id: xdp
    hook: eth0
    kind: standalone
    schema_version: 2
"#,
        )
        .unwrap();

        assert_eq!(config.channel.capacity, 1024);
        assert_eq!(config.channel.policy, OverflowPolicy::OverwriteOldest);

        let consumer = config.consumer.consumer_config();
        assert_eq!(consumer.poll_interval, Duration::from_millis(10));
        assert_eq!(consumer.batch_size, 256);
        assert_eq!(consumer.final_drain_max, 100);

        match &config.backend {
            BackendSection::Bpf(bpf) => {
                assert_eq!(bpf.artifacts, PathBuf::from("/usr/lib/hookwire"))
            }
            _ => panic!("unexpected backend"),
        }

        assert_eq!(config.sinks.log.format, LogFormat::Json);
        assert_eq!(
            config.sinks.log.path.as_deref(),
            Some(Path::new("/tmp/events.json"))
        );
        assert!(!config.sinks.metrics.enabled);

        assert_eq!(config.probes.len(), 2);
        assert_eq!(config.probes[0].kind(), ProbeKind::Entry);
        assert_eq!(config.probes[1].schema_version(), 2);
    }

    #[test]
    fn invalid() {
        assert!(Config::from_yaml("unknown: 1\n").is_err());
        assert!(Config::from_yaml("channel:\n  policy: block\n").is_err());
        assert!(Config::from_yaml("backend:\n  type: remote\n").is_err());
        assert!(Config::from_yaml("probes:\n  - id: p\n").is_err());
    }

    #[test]
    fn build() {
        let config = Config::from_yaml("sinks:\n  log:\n    enabled: false\n").unwrap();
        let sinks = config.sinks.build().unwrap();
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].name(), "metrics");

        assert!(config.backend.build().is_ok());

        let sim = Config::from_yaml("backend:\n  type: simulated\n  rate_hz: 0\n").unwrap();
        assert!(sim.backend.build().is_err());
    }

    #[test]
    fn load() {
        let path = std::env::temp_dir().join(format!("hookwire-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "channel:\n  capacity: 8\n").unwrap();

        assert_eq!(Config::load(&path).unwrap().channel.capacity, 8);
        std::fs::remove_file(&path).unwrap();

        assert!(Config::load(&path).is_err());
    }
}
