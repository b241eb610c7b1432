use std::hint::black_box;
use std::io::{Cursor, Read, Write};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Point-in-time node metrics, refreshed by the discovery heartbeat.
///
/// Times are in milliseconds. CPU load is a fraction in `[0, 1]` per node,
/// negative when the platform cannot report it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMetricsSnapshot {
    pub current_active_jobs: u32,
    pub average_active_jobs: f64,
    pub maximum_active_jobs: u32,
    pub current_waiting_jobs: u32,
    pub average_waiting_jobs: f64,
    pub maximum_waiting_jobs: u32,
    pub current_rejected_jobs: u32,
    pub current_cancelled_jobs: u32,
    pub current_cpu_load: f64,
    pub average_cpu_load: f64,
    pub total_cpus: u32,
    pub current_job_execute_time_ms: u64,
    pub average_job_execute_time_ms: f64,
    pub current_job_wait_time_ms: u64,
    pub average_job_wait_time_ms: f64,
    pub up_time_ms: u64,
}

impl NodeMetricsSnapshot {
    pub fn with_jobs(active: u32, waiting: u32) -> Self {
        Self {
            current_active_jobs: active,
            current_waiting_jobs: waiting,
            maximum_active_jobs: active,
            maximum_waiting_jobs: waiting,
            ..Default::default()
        }
    }
}

/// Micro-benchmark scores of a node, in operations per millisecond.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeBenchmark {
    pub integer_score: f64,
    pub long_score: f64,
    pub double_score: f64,
    pub io_score: f64,
    pub trig_score: f64,
}

const BENCH_ROUND: u64 = 10_000;

impl NodeBenchmark {
    /// Weighted sum of all scores.
    pub fn total(&self, integer: f64, long: f64, double: f64, io: f64, trig: f64) -> f64 {
        self.integer_score * integer
            + self.long_score * long
            + self.double_score * double
            + self.io_score * io
            + self.trig_score * trig
    }

    /// Runs each micro-benchmark for roughly `budget / 5`.
    pub fn measure(budget: Duration) -> Self {
        let slice = budget / 5;
        Self {
            integer_score: run_for(slice, bench_integer),
            long_score: run_for(slice, bench_long),
            double_score: run_for(slice, bench_double),
            io_score: run_for(slice, bench_io),
            trig_score: run_for(slice, bench_trig),
        }
    }
}

fn run_for(slice: Duration, round: fn(u64) -> u64) -> f64 {
    let start = Instant::now();
    let mut ops = 0u64;
    let mut acc = 0u64;
    loop {
        acc = acc.wrapping_add(round(ops));
        ops += BENCH_ROUND;
        if start.elapsed() >= slice {
            break;
        }
    }
    black_box(acc);
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    if elapsed_ms > 0.0 {
        ops as f64 / elapsed_ms
    } else {
        0.0
    }
}

fn bench_integer(seed: u64) -> u64 {
    let mut x = black_box(seed as u32 | 1);
    for i in 0..BENCH_ROUND as u32 {
        x = x.wrapping_mul(31).wrapping_add(i) ^ (x >> 3);
    }
    u64::from(x)
}

fn bench_long(seed: u64) -> u64 {
    let mut x = black_box(seed | 1);
    for i in 0..BENCH_ROUND {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(i) ^ (x >> 7);
    }
    x
}

fn bench_double(seed: u64) -> u64 {
    let mut x = black_box(seed as f64 + 1.5);
    for i in 0..BENCH_ROUND {
        x = x * 1.000001 + (i as f64) / (x + 1.0);
    }
    x.to_bits()
}

fn bench_io(seed: u64) -> u64 {
    let mut cursor = Cursor::new(Vec::with_capacity(BENCH_ROUND as usize));
    let byte = [black_box(seed as u8)];
    for _ in 0..BENCH_ROUND {
        // Writes into a Vec cannot fail.
        let _ = cursor.write(&byte);
    }
    cursor.set_position(0);
    let mut buf = [0u8; 64];
    let mut sum = 0u64;
    while let Ok(n) = cursor.read(&mut buf) {
        if n == 0 {
            break;
        }
        sum += buf[..n].iter().map(|b| u64::from(*b)).sum::<u64>();
    }
    sum
}

fn bench_trig(seed: u64) -> u64 {
    let mut x = black_box(seed as f64 * 0.001);
    for _ in 0..BENCH_ROUND {
        x = (x.sin() + x.cos()).atan() + 0.1;
    }
    x.to_bits()
}
