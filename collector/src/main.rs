//! Collector for cold-room monitor reports: stores readings, tracks device
//! errors and serves room charts and CSV exports.

mod dashboard;
mod export;
mod ingest;
mod pages;
mod server;
mod stats;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    server::run().await
}
