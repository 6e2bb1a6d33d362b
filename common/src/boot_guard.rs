use crate::{config::MonitorConfig, types::BootCounters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootDecision {
    /// Counters to persist before continuing start-up.
    pub counters: BootCounters,
    /// Extra delay to sleep before bringing up the radio and the bus.
    pub startup_delay_ms: u64,
    pub bootloop_detected: bool,
}

/// Crude boot-loop guard built on the persisted boot counter.
#[derive(Debug, Clone, Copy)]
pub struct BootGuard {
    threshold: u32,
    delay_ms: u64,
    stable_uptime_ms: u64,
}

impl BootGuard {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            threshold: config.bootloop_threshold,
            delay_ms: config.bootloop_delay_ms,
            stable_uptime_ms: config.stable_uptime_ms,
        }
    }

    pub fn on_boot(&self, stored: BootCounters) -> BootDecision {
        let counters = BootCounters {
            boot_count: stored.boot_count.saturating_add(1),
            error_count: stored.error_count,
        };
        let bootloop_detected = counters.boot_count > self.threshold;

        BootDecision {
            counters,
            startup_delay_ms: if bootloop_detected { self.delay_ms } else { 0 },
            bootloop_detected,
        }
    }

    pub fn is_stable(&self, uptime_ms: u64) -> bool {
        uptime_ms >= self.stable_uptime_ms
    }
}
