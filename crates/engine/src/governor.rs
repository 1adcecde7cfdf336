//! Resource governor
//!
//! Derives worker pool sizes from the configured CPU/RAM ceilings and the
//! load the system shows right now. Never cached: every stage asks again.

use crate::config::ResourceConfig;
use serde::Serialize;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One reading of the machine's load
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadSample {
    /// Logical cores
    pub cores: u32,
    /// Instantaneous CPU utilization across all cores, in percent
    pub cpu_usage_percent: f32,
    pub total_mem_gb: f32,
    pub available_mem_gb: f32,
}

impl LoadSample {
    /// Take a reading with sysinfo.
    ///
    /// CPU usage needs two refreshes separated by the minimum update interval,
    /// so this blocks for a short moment.
    pub fn capture() -> Self {
        use sysinfo::System;

        let mut sys = System::new();
        sys.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        Self {
            cores: num_cpus::get() as u32,
            cpu_usage_percent: sys.global_cpu_usage(),
            total_mem_gb: (sys.total_memory() as f64 / BYTES_PER_GB) as f32,
            available_mem_gb: (sys.available_memory() as f64 / BYTES_PER_GB) as f32,
        }
    }
}

/// Pool sizes for one stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerBudget {
    pub max_workers: u32,
    pub max_ocr_workers: u32,
    pub memory_per_worker_gb: f32,
    pub usable_mem_gb: f32,
}

/// Finite, non-negative, or zero
fn sane(v: f32) -> f32 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

/// Workers that fit in the CPU headroom under the ceiling
///
/// `floor(cores * max(ceiling - usage, 0) / 100)`, never below 1. An explicit
/// `max_workers` caps the result.
pub fn derive_worker_count(sample: &LoadSample, cfg: &ResourceConfig) -> u32 {
    let headroom = sane(sane(cfg.cpu_ceiling_percent) - sane(sample.cpu_usage_percent));
    let derived = ((sample.cores as f32) * headroom / 100.0).floor() as u32;
    let derived = derived.max(1);
    if cfg.max_workers > 0 {
        derived.min(cfg.max_workers)
    } else {
        derived
    }
}

/// Memory the OCR workers may use, in GB
pub fn usable_memory_gb(sample: &LoadSample, cfg: &ResourceConfig) -> f32 {
    let ceiling = sane(cfg.memory_ceiling_percent).min(100.0) / 100.0;
    (ceiling * sane(sample.total_mem_gb)).min(sane(sample.available_mem_gb))
}

/// OCR workers allowed by both CPU and memory headroom
///
/// Each OCR task runs a display server next to the tool, so the CPU share is
/// divided by the process multiplier. Never below 1.
pub fn derive_ocr_worker_count(sample: &LoadSample, cfg: &ResourceConfig) -> u32 {
    let workers = derive_worker_count(sample, cfg) as f32;
    let multiplier = if sane(cfg.ocr_process_multiplier) >= 1.0 {
        cfg.ocr_process_multiplier
    } else {
        1.0
    };
    let cpu_based = (workers / multiplier).floor() as u32;

    let per_worker = sane(cfg.memory_per_ocr_worker_gb);
    let mem_based = if per_worker > 0.0 {
        (usable_memory_gb(sample, cfg) / per_worker).floor() as u32
    } else {
        cpu_based
    };

    let derived = cpu_based.min(mem_based).max(1);
    if cfg.max_ocr_workers > 0 {
        derived.min(cfg.max_ocr_workers)
    } else {
        derived
    }
}

impl WorkerBudget {
    /// Derive both pool sizes from one reading
    pub fn derive(sample: &LoadSample, cfg: &ResourceConfig) -> Self {
        Self {
            max_workers: derive_worker_count(sample, cfg),
            max_ocr_workers: derive_ocr_worker_count(sample, cfg),
            memory_per_worker_gb: sane(cfg.memory_per_ocr_worker_gb),
            usable_mem_gb: usable_memory_gb(sample, cfg),
        }
    }
}

/// Worker count for the current system load
pub fn compute_worker_count(cfg: &ResourceConfig) -> u32 {
    derive_worker_count(&LoadSample::capture(), cfg)
}

/// OCR worker count, per-worker memory budget and usable memory, for the
/// current system load
pub fn compute_ocr_worker_count(cfg: &ResourceConfig) -> (u32, f32, f32) {
    let budget = WorkerBudget::derive(&LoadSample::capture(), cfg);
    (
        budget.max_ocr_workers,
        budget.memory_per_worker_gb,
        budget.usable_mem_gb,
    )
}

/// Full budget for the current system load
pub fn current_budget(cfg: &ResourceConfig) -> WorkerBudget {
    let sample = LoadSample::capture();
    let budget = WorkerBudget::derive(&sample, cfg);
    tracing::debug!(
        cores = sample.cores,
        cpu = sample.cpu_usage_percent,
        available_gb = sample.available_mem_gb,
        workers = budget.max_workers,
        ocr_workers = budget.max_ocr_workers,
        "Derived worker budget"
    );
    budget
}
