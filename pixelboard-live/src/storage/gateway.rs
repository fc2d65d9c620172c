//! Persistence gateway: the board's only view of durable storage.
//!
//! Two implementations, picked once by [`connect`]:
//! - [`StoreGateway`] writes through to a RocksDB [`PixelStore`]
//! - [`VolatileGateway`] accepts everything and stores nothing
//!
//! If the store cannot be opened the process runs in volatile mode for the
//! rest of its life. There is no reconnection.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::rocks::{PixelStore, SnapshotInfo, StoreConfig, StoreError};
use crate::board::PixelChange;

/// Durable sink for committed pixels.
///
/// Every call may fail at any time; callers log and carry on.
pub trait PersistenceGateway: Send + Sync {
    /// Persist one committed mutation.
    fn write_through(&self, change: &PixelChange) -> Result<(), StoreError>;

    /// Take a labelled snapshot of everything persisted so far.
    /// Returns `None` when nothing was stored.
    fn snapshot(&self, label: &str) -> Result<Option<SnapshotInfo>, StoreError>;

    /// Bulk-load every persisted pixel (startup hydration).
    fn load_pixels(&self) -> Result<Vec<PixelChange>, StoreError>;

    /// Whether this gateway discards everything.
    fn is_volatile(&self) -> bool;
}

/// Gateway used when no durable store is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct VolatileGateway;

impl PersistenceGateway for VolatileGateway {
    fn write_through(&self, _change: &PixelChange) -> Result<(), StoreError> {
        Ok(())
    }

    fn snapshot(&self, _label: &str) -> Result<Option<SnapshotInfo>, StoreError> {
        Ok(None)
    }

    fn load_pixels(&self) -> Result<Vec<PixelChange>, StoreError> {
        Ok(Vec::new())
    }

    fn is_volatile(&self) -> bool {
        true
    }
}

/// Gateway backed by a RocksDB [`PixelStore`].
pub struct StoreGateway {
    store: PixelStore,
}

impl StoreGateway {
    pub fn new(store: PixelStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &PixelStore {
        &self.store
    }
}

impl PersistenceGateway for StoreGateway {
    fn write_through(&self, change: &PixelChange) -> Result<(), StoreError> {
        self.store.put_pixel(change)
    }

    fn snapshot(&self, label: &str) -> Result<Option<SnapshotInfo>, StoreError> {
        self.store.create_snapshot(label).map(Some)
    }

    fn load_pixels(&self) -> Result<Vec<PixelChange>, StoreError> {
        self.store.load_pixels()
    }

    fn is_volatile(&self) -> bool {
        false
    }
}

/// Open the configured store, degrading to volatile mode on failure.
pub fn connect(config: &StoreConfig) -> Arc<dyn PersistenceGateway> {
    if config.path.is_none() {
        log::info!("No storage path configured, running in volatile mode");
        return Arc::new(VolatileGateway);
    }

    match PixelStore::open(config.clone()) {
        Ok(store) => {
            log::info!("Pixel store opened at {}", store.path().display());
            Arc::new(StoreGateway::new(store))
        }
        Err(e) => {
            log::warn!("Failed to open pixel store: {e}");
            log::warn!("Working in VOLATILE mode, nothing will be persisted");
            Arc::new(VolatileGateway)
        }
    }
}

/// Spawn the periodic snapshot task.
///
/// Does nothing (returns `None`) for a volatile gateway. Snapshot failures
/// are logged and the schedule keeps running.
pub fn spawn_snapshot_cadence(
    gateway: Arc<dyn PersistenceGateway>,
    every: Duration,
) -> Option<JoinHandle<()>> {
    if gateway.is_volatile() || every.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; skip it so startup doesn't snapshot
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let label = format!("auto-{}", unix_now());
            let gw = gateway.clone();
            let result = tokio::task::spawn_blocking(move || gw.snapshot(&label)).await;
            match result {
                Ok(Ok(Some(info))) => log::info!(
                    "Created snapshot '{}' (id {}, {} pixels, {} bytes)",
                    info.label,
                    info.id,
                    info.pixel_count,
                    info.compressed_size
                ),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => log::error!("Snapshot failed: {e}"),
                Err(e) => log::error!("Snapshot task panicked: {e}"),
            }
        }
    }))
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_gateway_is_noop() {
        let gateway = VolatileGateway;
        let change = PixelChange { x: 1, y: 2, color_index: 3 };
        assert!(gateway.write_through(&change).is_ok());
        assert!(gateway.snapshot("label").unwrap().is_none());
        assert!(gateway.load_pixels().unwrap().is_empty());
        assert!(gateway.is_volatile());
    }

    #[test]
    fn test_connect_without_path_is_volatile() {
        let gateway = connect(&StoreConfig::volatile());
        assert!(gateway.is_volatile());
    }

    #[test]
    fn test_connect_unopenable_path_degrades() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the database directory should be
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"occupied").unwrap();

        let gateway = connect(&StoreConfig::for_testing(&blocker));
        assert!(gateway.is_volatile());
    }

    #[test]
    fn test_store_gateway_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = connect(&StoreConfig::for_testing(dir.path().join("db")));
        assert!(!gateway.is_volatile());

        let change = PixelChange { x: 4, y: 5, color_index: 6 };
        gateway.write_through(&change).unwrap();
        assert_eq!(gateway.load_pixels().unwrap(), vec![change]);

        let info = gateway.snapshot("manual").unwrap().unwrap();
        assert_eq!(info.pixel_count, 1);
    }

    #[tokio::test]
    async fn test_snapshot_cadence_skipped_in_volatile_mode() {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(VolatileGateway);
        assert!(spawn_snapshot_cadence(gateway, Duration::from_millis(10)).is_none());
    }

    #[tokio::test]
    async fn test_snapshot_cadence_creates_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = PixelStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let gateway = Arc::new(StoreGateway::new(store));

        let handle = spawn_snapshot_cadence(gateway.clone(), Duration::from_millis(20)).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();

        let snapshots = gateway.store().list_snapshots().unwrap();
        assert!(!snapshots.is_empty());
        assert!(snapshots.iter().all(|s| s.label.starts_with("auto-")));
    }
}
