use portwarden::{App, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout는 JSON 출력 전용
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    let (app, warnings) = App::open(config)?;
    for warning in &warnings {
        tracing::warn!("{}", warning);
    }

    let discovery = app.discover().await?;
    tracing::info!(
        "{} listeners, {} managed services",
        discovery.processes.len(),
        discovery.services.len()
    );
    println!("{}", serde_json::to_string_pretty(&discovery)?);
    Ok(())
}
