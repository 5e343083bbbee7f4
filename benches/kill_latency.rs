// Latency benchmark for the run lifecycle
// Measures end-to-end overhead of a minimal run and the time from a
// wall-limit breach to a fully drained tree.
// Targets: spawn p50 < 150ms, p95 < 300ms; kill drain p50 < 1s, p95 < 2s

use runcage::{ResourceLimits, RunExecutor, RunSpec, RunStatus};
use std::ffi::OsString;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 30;
const WARMUP_ITERATIONS: usize = 3;

/// Latency percentiles
struct LatencyStats {
    p50: Duration,
    p95: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();

        let p50_idx = (len as f64 * 0.50) as usize;
        let p95_idx = ((len as f64 * 0.95) as usize).min(len - 1);

        let sum: Duration = samples.iter().sum();
        let mean = sum / len as u32;

        Self {
            p50: samples[p50_idx],
            p95: samples[p95_idx],
            min: samples[0],
            max: samples[len - 1],
            mean,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

struct BenchmarkResult {
    scenario: String,
    stats: LatencyStats,
    passed: bool,
    reason: Option<String>,
}

impl BenchmarkResult {
    fn print(&self) {
        println!("\n=== {} ===", self.scenario);
        self.stats.print("Latency");

        if self.passed {
            println!("✅ PASS");
        } else if let Some(reason) = &self.reason {
            println!("❌ FAIL: {}", reason);
        }
    }
}

fn sh(script: &str) -> RunSpec {
    RunSpec::new(vec![
        OsString::from("sh"),
        OsString::from("-c"),
        OsString::from(script),
    ])
}

/// Full lifecycle of a trivial run: group create, enroll, exec, reap,
/// measure, destroy.
fn benchmark_spawn_overhead(executor: &RunExecutor) -> BenchmarkResult {
    let spec = sh("true");

    for _ in 0..WARMUP_ITERATIONS {
        let _ = executor.execute(&spec);
    }

    let mut samples = Vec::new();
    for _ in 0..ITERATIONS {
        let start = Instant::now();
        let result = executor.execute(&spec);
        samples.push(start.elapsed());
        if let Ok(result) = result {
            assert_eq!(result.status, RunStatus::Exited);
        }
    }

    let stats = LatencyStats::from_samples(samples);
    let passed = stats.p50 < Duration::from_millis(150) && stats.p95 < Duration::from_millis(300);
    let reason = if !passed {
        Some(format!(
            "p50={:?} (target <150ms), p95={:?} (target <300ms)",
            stats.p50, stats.p95
        ))
    } else {
        None
    };

    BenchmarkResult {
        scenario: "Trivial run lifecycle".to_string(),
        stats,
        passed,
        reason,
    }
}

/// Time from wall-limit breach to a fully drained tree. The limit is
/// 100ms, so sample minus 100ms is detection plus kill plus teardown.
fn benchmark_kill_drain(executor: &RunExecutor) -> BenchmarkResult {
    let mut spec = sh("sleep 60");
    spec.limits = ResourceLimits {
        wall_time: Some(Duration::from_millis(100)),
        ..Default::default()
    };

    for _ in 0..WARMUP_ITERATIONS {
        let _ = executor.execute(&spec);
    }

    let mut samples = Vec::new();
    for _ in 0..ITERATIONS {
        let start = Instant::now();
        let result = executor.execute(&spec);
        samples.push(start.elapsed());
        if let Ok(result) = result {
            assert_eq!(result.status, RunStatus::LimitExceeded);
        }
    }

    let stats = LatencyStats::from_samples(samples);
    let passed = stats.p50 < Duration::from_secs(1) && stats.p95 < Duration::from_secs(2);
    let reason = if !passed {
        Some(format!(
            "p50={:?} (target <1s), p95={:?} (target <2s)",
            stats.p50, stats.p95
        ))
    } else {
        None
    };

    BenchmarkResult {
        scenario: "Wall-limit kill drain".to_string(),
        stats,
        passed,
        reason,
    }
}

fn main() {
    println!("=== runcage Run Lifecycle Benchmark ===");
    println!(
        "Iterations: {} (after {} warmup)",
        ITERATIONS, WARMUP_ITERATIONS
    );

    if unsafe { libc::geteuid() } != 0 {
        println!("\nSkipping: benchmark needs root and a cgroup hierarchy");
        std::process::exit(0);
    }
    let executor = match RunExecutor::new() {
        Ok(executor) => executor.with_poll_interval(Duration::from_millis(10)),
        Err(err) => {
            println!("\nSkipping: {}", err);
            std::process::exit(0);
        }
    };

    let results = vec![
        benchmark_spawn_overhead(&executor),
        benchmark_kill_drain(&executor),
    ];

    for result in &results {
        result.print();
    }

    let passed_count = results.iter().filter(|r| r.passed).count();
    let total_count = results.len();

    println!("\n=== Summary ===");
    println!("{}/{} scenarios passed", passed_count, total_count);

    if passed_count == total_count {
        println!("✅ All latency budgets met");
        std::process::exit(0);
    } else {
        println!("❌ Some latency budgets exceeded");
        std::process::exit(1);
    }
}
