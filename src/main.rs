use std::sync::Arc;

use peer_core_host::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    peer_core_host::startup(config).await
}
