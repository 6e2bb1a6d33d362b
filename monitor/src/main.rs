//! Cold-room probe monitor.
//!
//! Built with `--features esp32` this drives DS18B20 probes, an SSD1306 status
//! display and the report uplink on an ESP32. The default build runs the same
//! engine against simulated probes so the report path can be exercised locally.

#[cfg(feature = "esp32")]
mod esp;
#[cfg(not(feature = "esp32"))]
mod host;

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run()
}

#[cfg(not(feature = "esp32"))]
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
