pub mod app;
pub mod config;
pub mod logging;
pub mod relay;
pub mod transport;

pub async fn run(overrides: config::Overrides) -> anyhow::Result<()> {
    app::run(overrides).await
}
