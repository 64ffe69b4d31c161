use scribe_sync::{Config, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "scribe-sync.toml".to_string());
    let config = Config::load_or_default(&path)?;

    let server = SyncServer::from_config(&config)?;
    server.run().await?;
    Ok(())
}
