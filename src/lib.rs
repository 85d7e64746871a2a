pub mod config;

use std::sync::Arc;

use anyhow::Result;

use self::config::Config;

/// In order to let integration tests start the node without going through
/// `main`, a function is exposed that does what `main` would otherwise do.
pub async fn startup(config: Arc<Config>) -> Result<()> {
    log::debug!("detected {} cpus", num_cpus::get());

    let now: Arc<dyn Fn() -> u64 + Send + Sync> = Arc::new(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64
    });

    let fs = Arc::new(wal::TokioFilesystem);
    let mut wal_config = wal::WalConfig::new(&config.storage.root);
    if let Some(max_segment_size) = config.storage.max_segment_size {
        wal_config.max_segment_size = max_segment_size;
    }
    wal_config.fsync_on_commit = config.storage.fsync_on_commit;
    wal_config.cleanup_interval = config
        .storage
        .cleanup_interval_secs
        .map(std::time::Duration::from_secs);

    let storage = Arc::new(wal::WalStorage::new(fs, wal_config, now));
    storage.initialize().await?;

    log::info!(
        "peer core started for fabric {} node {:#018x}, storage at {}",
        config.node.fabric_index,
        config.node.node_id,
        config.storage.root.display(),
    );

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    storage.close().await?;

    Ok(())
}
