//! Load probes turn a node's metrics into a single non-negative load.
//! Lower load means the adaptive balancer sends the node more jobs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PlacementError, Result};
use crate::topology::node::ATTR_NODE_BENCHMARK;
use crate::topology::{AttributeValue, GridNode};

pub trait LoadProbe: Send + Sync {
    /// `jobs_sent` is how many jobs this balancer sent the node since its
    /// metrics were last refreshed. Must return a value `>= 0`.
    fn load(&self, node: &GridNode, jobs_sent: u64) -> f64;
}

/// Average or current CPU load, optionally divided by processor count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuLoadProbe {
    pub use_average: bool,
    pub use_processors: bool,
    pub processors_coefficient: f64,
}

impl Default for CpuLoadProbe {
    fn default() -> Self {
        Self {
            use_average: true,
            use_processors: true,
            processors_coefficient: 1.0,
        }
    }
}

impl LoadProbe for CpuLoadProbe {
    fn load(&self, node: &GridNode, _jobs_sent: u64) -> f64 {
        let metrics = &node.metrics;

        let mut k = 1.0;
        if self.use_processors && metrics.total_cpus > 1 {
            k = f64::from(metrics.total_cpus) * self.processors_coefficient;
        }

        let raw = if self.use_average {
            metrics.average_cpu_load
        } else {
            metrics.current_cpu_load
        };

        let load = raw / k;
        if load < 0.0 {
            0.0
        } else {
            load
        }
    }
}

/// Active plus waiting jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobCountLoadProbe {
    pub use_average: bool,
}

impl Default for JobCountLoadProbe {
    fn default() -> Self {
        Self { use_average: true }
    }
}

impl LoadProbe for JobCountLoadProbe {
    fn load(&self, node: &GridNode, _jobs_sent: u64) -> f64 {
        let metrics = &node.metrics;

        if self.use_average {
            let load = metrics.average_active_jobs + metrics.average_waiting_jobs;
            if load > 0.0 {
                return load;
            }
        }

        f64::from(metrics.current_active_jobs) + f64::from(metrics.current_waiting_jobs)
    }
}

/// Job execution plus wait time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingTimeLoadProbe {
    pub use_average: bool,
}

impl Default for ProcessingTimeLoadProbe {
    fn default() -> Self {
        Self { use_average: true }
    }
}

impl LoadProbe for ProcessingTimeLoadProbe {
    fn load(&self, node: &GridNode, _jobs_sent: u64) -> f64 {
        let metrics = &node.metrics;

        if self.use_average {
            let load = metrics.average_job_execute_time_ms + metrics.average_job_wait_time_ms;
            if load > 0.0 {
                return load;
            }
        }

        (metrics.current_job_execute_time_ms + metrics.current_job_wait_time_ms) as f64
    }
}

/// Inverse of a node's weighted micro-benchmark score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkLoadProbe {
    pub integer_weight: f64,
    pub long_weight: f64,
    pub double_weight: f64,
    pub io_weight: f64,
    pub trig_weight: f64,
}

impl Default for BenchmarkLoadProbe {
    fn default() -> Self {
        Self {
            integer_weight: 1.0,
            long_weight: 1.0,
            double_weight: 1.0,
            io_weight: 1.0,
            trig_weight: 1.0,
        }
    }
}

impl LoadProbe for BenchmarkLoadProbe {
    fn load(&self, node: &GridNode, _jobs_sent: u64) -> f64 {
        let Some(bench) = node
            .attribute(ATTR_NODE_BENCHMARK)
            .and_then(AttributeValue::as_benchmark)
        else {
            return 0.0;
        };

        let score = bench.total(
            self.integer_weight,
            self.long_weight,
            self.double_weight,
            self.io_weight,
            self.trig_weight,
        );

        if score > 0.0 {
            1.0 / score
        } else {
            0.0
        }
    }
}

/// Serializable probe selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeConfig {
    Cpu(CpuLoadProbe),
    JobCount(JobCountLoadProbe),
    ProcessingTime(ProcessingTimeLoadProbe),
    Benchmark(BenchmarkLoadProbe),
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig::ProcessingTime(ProcessingTimeLoadProbe::default())
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            ProbeConfig::Cpu(p) if p.processors_coefficient <= 0.0 => {
                Err(PlacementError::InvalidConfig(
                    "processors_coefficient must be greater than 0".to_string(),
                ))
            }
            ProbeConfig::Benchmark(p)
                if [
                    p.integer_weight,
                    p.long_weight,
                    p.double_weight,
                    p.io_weight,
                    p.trig_weight,
                ]
                .iter()
                .any(|w| *w < 0.0) =>
            {
                Err(PlacementError::InvalidConfig(
                    "benchmark weights must not be negative".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn build(&self) -> Arc<dyn LoadProbe> {
        match self {
            ProbeConfig::Cpu(p) => Arc::new(p.clone()),
            ProbeConfig::JobCount(p) => Arc::new(p.clone()),
            ProbeConfig::ProcessingTime(p) => Arc::new(p.clone()),
            ProbeConfig::Benchmark(p) => Arc::new(p.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{NodeBenchmark, NodeMetricsSnapshot};

    fn node(metrics: NodeMetricsSnapshot) -> GridNode {
        GridNode::random().with_metrics(metrics)
    }

    #[test]
    fn job_count_falls_back_to_current() {
        let probe = JobCountLoadProbe::default();
        let n = node(NodeMetricsSnapshot::with_jobs(2, 3));
        assert_eq!(probe.load(&n, 0), 5.0);

        let n = node(NodeMetricsSnapshot {
            average_active_jobs: 1.5,
            average_waiting_jobs: 0.5,
            ..NodeMetricsSnapshot::with_jobs(2, 3)
        });
        assert_eq!(probe.load(&n, 0), 2.0);
    }

    #[test]
    fn processing_time_falls_back_to_current() {
        let probe = ProcessingTimeLoadProbe::default();
        let n = node(NodeMetricsSnapshot {
            current_job_execute_time_ms: 40,
            current_job_wait_time_ms: 10,
            ..Default::default()
        });
        assert_eq!(probe.load(&n, 7), 50.0);

        let n = node(NodeMetricsSnapshot {
            average_job_execute_time_ms: 20.0,
            average_job_wait_time_ms: 5.0,
            current_job_execute_time_ms: 40,
            ..Default::default()
        });
        assert_eq!(probe.load(&n, 0), 25.0);
    }

    #[test]
    fn cpu_divides_by_processors_and_clamps() {
        let probe = CpuLoadProbe::default();
        let n = node(NodeMetricsSnapshot {
            average_cpu_load: 0.8,
            total_cpus: 4,
            ..Default::default()
        });
        assert!((probe.load(&n, 0) - 0.2).abs() < 1e-12);

        let single = node(NodeMetricsSnapshot {
            average_cpu_load: 0.8,
            total_cpus: 1,
            ..Default::default()
        });
        assert!((probe.load(&single, 0) - 0.8).abs() < 1e-12);

        let unknown = node(NodeMetricsSnapshot {
            current_cpu_load: -1.0,
            ..Default::default()
        });
        let current = CpuLoadProbe {
            use_average: false,
            ..CpuLoadProbe::default()
        };
        assert_eq!(current.load(&unknown, 0), 0.0);
    }

    #[test]
    fn benchmark_is_inverse_score() {
        let probe = BenchmarkLoadProbe::default();
        assert_eq!(probe.load(&GridNode::random(), 0), 0.0);

        let bench = NodeBenchmark {
            integer_score: 1.0,
            long_score: 1.0,
            double_score: 1.0,
            io_score: 1.0,
            trig_score: 0.0,
        };
        let n = GridNode::random()
            .with_attribute(ATTR_NODE_BENCHMARK, AttributeValue::Benchmark(bench));
        assert_eq!(probe.load(&n, 0), 0.25);
    }

    #[test]
    fn validate_rejects_bad_probe_settings() {
        let cpu = ProbeConfig::Cpu(CpuLoadProbe {
            processors_coefficient: 0.0,
            ..CpuLoadProbe::default()
        });
        assert!(cpu.validate().is_err());

        let bench = ProbeConfig::Benchmark(BenchmarkLoadProbe {
            io_weight: -1.0,
            ..BenchmarkLoadProbe::default()
        });
        assert!(bench.validate().is_err());

        assert!(ProbeConfig::default().validate().is_ok());
    }

    #[test]
    fn probe_config_from_json() {
        let cfg: ProbeConfig =
            serde_json::from_str(r#"{"kind":"job_count","use_average":false}"#).unwrap();
        assert_eq!(
            cfg,
            ProbeConfig::JobCount(JobCountLoadProbe { use_average: false })
        );
    }
}
