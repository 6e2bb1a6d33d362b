use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{debug, info, warn};

use coldroom_common::{
    types::{format_mac, format_probe_address},
    BootCounters, BootGuard, ErrorKind, MonitorAction, MonitorEngine, ProbeFault, ReportPayload,
    RuntimeConfig, SendOutcome,
};

const TICK_MS: u64 = 100;
const DEFAULT_DATA_DIR: &str = "./.coldroom-monitor";
const RUNTIME_FILE: &str = "runtime.json";
const COUNTERS_FILE: &str = "counters.json";
const SIMULATED_MAC: [u8; 6] = [0x24, 0x0a, 0xc4, 0x10, 0x20, 0x30];

/// JSON files standing in for NVS on the host.
struct HostStore {
    dir: PathBuf,
}

impl HostStore {
    fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let path = self.dir.join(RUNTIME_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn load_counters(&self) -> anyhow::Result<BootCounters> {
        match tokio::fs::read_to_string(self.dir.join(COUNTERS_FILE)).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BootCounters::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_counters(&self, counters: BootCounters) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        write_atomic(&self.dir.join(COUNTERS_FILE), &serde_json::to_vec(&counters)?).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

struct SimulatedProbe {
    address: String,
    base_c: f32,
}

/// A fixed set of probes that answer with slowly drifting cold-room temperatures.
struct SimulatedBus {
    probes: Vec<SimulatedProbe>,
    reads: u64,
}

impl SimulatedBus {
    fn new() -> Self {
        let probes = [
            (0xC6_0B_24_40_BB_BD_09_28_u64, 2.0),
            (0x5A_03_11_22_33_44_55_28, -18.0),
            (0x17_00_00_0A_0B_0C_0D_28, 4.5),
        ]
        .into_iter()
        .map(|(rom, base_c)| SimulatedProbe {
            address: format_probe_address(rom),
            base_c,
        })
        .collect();

        Self { probes, reads: 0 }
    }

    fn search(&self) -> Vec<String> {
        self.probes.iter().map(|probe| probe.address.clone()).collect()
    }

    fn read(&mut self, address: &str) -> Result<f32, ProbeFault> {
        self.reads = self.reads.saturating_add(1);
        let probe = self
            .probes
            .iter()
            .find(|probe| probe.address == address)
            .ok_or(ProbeFault::Disconnected)?;
        Ok(probe.base_c + (self.reads % 8) as f32 * 0.1)
    }
}

struct Reporter {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl Reporter {
    fn new(runtime: &RuntimeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(runtime.monitor.http_timeout_ms))
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            client,
            url: runtime.network.report_url.clone(),
            api_key: runtime.network.api_key.clone(),
        })
    }

    async fn send(&self, payload: &ReportPayload) -> SendOutcome {
        let mut request = self.client.post(&self.url).json(payload);
        if !self.api_key.is_empty() {
            request = request.header("X-API-Key", &self.api_key);
        }

        match request.send().await {
            Ok(response) => SendOutcome::Status(response.status().as_u16()),
            Err(err) => SendOutcome::Failed(err.to_string()),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("MONITOR_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
    let store = HostStore::new(&data_dir);

    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    if let Ok(url) = std::env::var("COLLECTOR_URL") {
        runtime.network.report_url = url;
    }
    if let Ok(key) = std::env::var("COLLECTOR_API_KEY") {
        runtime.network.api_key = key;
    }
    runtime.monitor.sanitize();

    let stored = store.load_counters().await.unwrap_or_else(|err| {
        warn!("failed to load boot counters: {err:#}");
        BootCounters::default()
    });
    let boot = BootGuard::new(&runtime.monitor).on_boot(stored);
    if let Err(err) = store.save_counters(boot.counters).await {
        warn!("failed to persist boot counters: {err:#}");
    }
    if boot.bootloop_detected {
        warn!(
            "boot count {} over threshold; delaying start-up by {} ms",
            boot.counters.boot_count, boot.startup_delay_ms
        );
        tokio::time::sleep(Duration::from_millis(boot.startup_delay_ms)).await;
    }

    let mut engine = MonitorEngine::new(runtime.monitor.clone(), format_mac(SIMULATED_MAC), boot.counters);
    if boot.bootloop_detected {
        engine.record_error(
            0,
            ErrorKind::BootloopDetected,
            format!("{} rapid restarts", boot.counters.boot_count),
        );
    }

    let mut bus = SimulatedBus::new();
    let found = engine.register_probes(&bus.search(), &runtime.labels);
    info!("{found} simulated probe(s) registered");
    engine.set_wifi_connected(0, true);

    let reporter = Reporter::new(&runtime)?;
    info!(
        "monitor simulation started (device {}, reporting to {})",
        engine.device_mac(),
        reporter.url
    );

    let started = Instant::now();
    let mut errors_seen = engine.errors().total();
    let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS));

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }

        let now_ms = started.elapsed().as_millis() as u64;
        for action in engine.tick(now_ms) {
            match action {
                MonitorAction::ReadProbes(addresses) => {
                    let results = addresses
                        .into_iter()
                        .map(|address| {
                            let reading = bus.read(&address);
                            (address, reading)
                        })
                        .collect();
                    engine.apply_readings(now_ms, results);
                }
                MonitorAction::RescanBus => {
                    let added = engine.register_probes(&bus.search(), &runtime.labels);
                    if added > 0 {
                        info!("{added} new probe(s) found");
                    }
                }
                MonitorAction::RenderPage(page) => {
                    debug!("[{}] {}", page.title(), engine.page_lines(page, now_ms).join(" | "));
                }
                MonitorAction::SendReport(payload) => {
                    info!("sending {} reading(s)", payload.readings.len());
                    let outcome = reporter.send(&payload).await;
                    match &outcome {
                        SendOutcome::Status(200) => info!("report accepted"),
                        SendOutcome::Status(code) => warn!("report rejected with HTTP {code}"),
                        SendOutcome::Failed(reason) => warn!("report failed: {reason}"),
                    }
                    engine.complete_send(started.elapsed().as_millis() as u64, outcome);
                }
                MonitorAction::ReconnectWifi => engine.set_wifi_connected(now_ms, true),
                MonitorAction::SaveCounters(counters) => {
                    if let Err(err) = store.save_counters(counters).await {
                        warn!("failed to persist counters: {err:#}");
                    }
                }
            }
        }

        let total = engine.errors().total();
        let fresh = total.saturating_sub(errors_seen) as usize;
        for entry in engine.errors().iter().take(fresh).collect::<Vec<_>>().into_iter().rev() {
            warn!("{}", entry.render());
        }
        errors_seen = total;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn counters_survive_a_restart() {
        let dir = std::env::temp_dir().join(format!("coldroom-monitor-test-{}", std::process::id()));
        let store = HostStore::new(&dir);

        assert_eq!(store.load_counters().await.unwrap(), BootCounters::default());

        let counters = BootCounters {
            boot_count: 3,
            error_count: 11,
        };
        store.save_counters(counters).await.unwrap();
        assert_eq!(HostStore::new(&dir).load_counters().await.unwrap(), counters);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn simulated_bus_reports_unknown_probe_as_disconnected() {
        let mut bus = SimulatedBus::new();
        let addresses = bus.search();

        assert_eq!(addresses.len(), 3);
        assert_eq!(addresses[0], "289BDBB4024BC6");
        assert!(bus.read(&addresses[1]).is_ok());
        assert_eq!(bus.read("289FBDBB4024BC6"), Err(ProbeFault::Disconnected));
    }
}
