use std::collections::HashMap;

/// Cumulative CPU counters from one statistics sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCounters {
    pub total: u64,
    pub system: u64,
}

/// Share of host CPU used between two samples. A non-positive host delta or a
/// container counter that went backwards (restart) yields 0.0.
pub fn cpu_utilization(prev: CpuCounters, next: CpuCounters) -> f64 {
    let used = i128::from(next.total) - i128::from(prev.total);
    let system = i128::from(next.system) - i128::from(prev.system);
    if system <= 0 || used < 0 {
        return 0.0;
    }
    used as f64 / system as f64
}

/// Memory usage as a fraction of the limit; 0.0 without a usable limit.
pub fn memory_utilization(usage: Option<u64>, limit: Option<u64>) -> f64 {
    match (usage, limit) {
        (Some(usage), Some(limit)) if limit > 0 => usage as f64 / limit as f64,
        _ => 0.0,
    }
}

/// Last CPU counters seen per container.
#[derive(Debug, Default)]
pub struct UsageTracker {
    baselines: HashMap<String, CpuCounters>,
}

impl UsageTracker {
    /// Record `counters` for `container_id` and return the utilization since
    /// the previous sample. The first sample only sets the baseline.
    pub fn observe(&mut self, container_id: &str, counters: CpuCounters) -> Option<f64> {
        self.baselines
            .insert(container_id.to_string(), counters)
            .map(|prev| cpu_utilization(prev, counters))
    }

    pub fn forget(&mut self, container_id: &str) {
        self.baselines.remove(container_id);
    }

    pub fn tracked(&self) -> usize {
        self.baselines.len()
    }
}
