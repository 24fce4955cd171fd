//! Jobs Monitor - Entry Point
//!
//! Declares the job topology, records queue health and serves the admin API.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    marketplace_jobs_monitor::run().await
}
