//! Worker planning module for the transcoder
//!
//! Resolves the "auto" values in the worker and VMAF thread settings against the
//! machine's CPU count.

use crate::config::Config;

/// Worker plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPlan {
    /// Logical CPU cores seen when the plan was derived
    pub total_cores: u32,
    /// Parallel encode workers
    pub encode_workers: u32,
    /// Parallel VMAF workers
    pub quality_workers: u32,
    /// Threads handed to each libvmaf run
    pub vmaf_threads: u32,
}

impl WorkerPlan {
    /// Derive a worker plan from configuration
    ///
    /// Uses the following rules:
    /// - Pool sizes of 0 mean auto and resolve to a single worker, since every
    ///   encode already saturates the GPU and every VMAF run its thread budget
    /// - VMAF threads of 0 resolve to the detected core count
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Same as [`WorkerPlan::derive`] with an explicit core count
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let total_cores = total_cores.max(1);

        Self {
            total_cores,
            encode_workers: resolve_pool(cfg.workers.encode),
            quality_workers: resolve_pool(cfg.workers.quality),
            vmaf_threads: if cfg.quality.threads > 0 {
                cfg.quality.threads
            } else {
                total_cores
            },
        }
    }
}

fn resolve_pool(requested: u32) -> u32 {
    requested.max(1)
}

/// Public function to derive a worker plan from configuration
pub fn derive_plan(cfg: &Config) -> WorkerPlan {
    WorkerPlan::derive(cfg)
}
