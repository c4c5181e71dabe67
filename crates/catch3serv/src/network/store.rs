//! Process-wide routing network: lazily populated, per-H3_3 shards of the
//! segment table with an on-disk parquet cache.
//!
//! Shard population is serialised per key: the first task to request a key
//! performs the load while concurrent requesters wait on a broadcast
//! channel, so every reader observes the identical immutable shard.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::block_in_place;
use tokio_postgres::GenericClient;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::segments::SegmentTable;
use crate::db;
use crate::error::Error;

/// Where shard contents come from when they are neither in memory nor in
/// the disk cache.
#[async_trait]
pub trait SegmentSource: Sync {
    async fn segments(&self, h3_3: i32) -> Result<SegmentTable, Error>;
}

/// The production source: a bounded SELECT over `basic.segment`.
pub struct PgSegmentSource<'a, C>(pub &'a C);

#[async_trait]
impl<'a, C> SegmentSource for PgSegmentSource<'a, C>
where
    C: GenericClient + Sync,
{
    async fn segments(&self, h3_3: i32) -> Result<SegmentTable, Error> {
        db::load_segments(self.0, h3_3).await
    }
}

enum ShardEntry {
    Available(Arc<SegmentTable>),
    Loading(broadcast::Sender<Result<Arc<SegmentTable>, String>>),
}

pub struct RoutingNetwork {
    cache_dir: PathBuf,
    keys: Vec<i32>,
    shards: Mutex<HashMap<i32, ShardEntry>>,
}

impl RoutingNetwork {
    /// Enumerates the H3_3 keys covering the configured geofence and
    /// prepares the cache directory. Shard contents are loaded on demand.
    pub async fn open(
        client: &impl GenericClient,
        region_table: &str,
        cache_dir: &Path,
    ) -> Result<Self, Error> {
        let keys = db::geofence_h3_3_cells(client, region_table).await?;
        info!("routing network covers {} h3_3 cells", keys.len());
        Self::with_keys(keys, cache_dir)
    }

    pub fn with_keys(keys: Vec<i32>, cache_dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(cache_dir)?;
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            keys,
            shards: Mutex::new(HashMap::new()),
        })
    }

    pub fn covers(&self, h3_3: i32) -> bool {
        self.keys.contains(&h3_3)
    }

    pub fn keys(&self) -> &[i32] {
        &self.keys
    }

    /// Returns the immutable shard for `h3_3`, loading it from the disk
    /// cache or from `source` on first demand. Keys outside the geofence
    /// yield [`Error::BufferExceedsNetwork`].
    pub async fn shard<S: SegmentSource>(
        &self,
        source: &S,
        h3_3: i32,
    ) -> Result<Arc<SegmentTable>, Error> {
        if !self.covers(h3_3) {
            return Err(Error::BufferExceedsNetwork);
        }

        let (tx, rx) = {
            let mut guard = self.shards.lock().await;
            match guard.get(&h3_3) {
                Some(ShardEntry::Available(table)) => {
                    debug!("shard {}: in memory", h3_3);
                    return Ok(table.clone());
                }
                Some(ShardEntry::Loading(tx)) => {
                    debug!("shard {}: waiting for in-flight load", h3_3);
                    (None, Some(tx.subscribe()))
                }
                None => {
                    let (tx, _) = broadcast::channel(1);
                    guard.insert(h3_3, ShardEntry::Loading(tx.clone()));
                    (Some(tx), None)
                }
            }
        };

        match (tx, rx) {
            (Some(tx), None) => {
                let result = self.load_shard(source, h3_3).await;
                {
                    let mut guard = self.shards.lock().await;
                    match &result {
                        Ok(table) => {
                            guard.insert(h3_3, ShardEntry::Available(table.clone()));
                        }
                        Err(_) => {
                            // load errors are not cached
                            guard.remove(&h3_3);
                        }
                    }
                }
                let _ = tx.send(
                    result
                        .as_ref()
                        .map(Arc::clone)
                        .map_err(|e| e.to_string()),
                );
                result
            }
            (None, Some(mut rx)) => match rx.recv().await {
                Ok(Ok(table)) => Ok(table),
                Ok(Err(reason)) => Err(Error::ShardLoad { h3_3, reason }),
                Err(_) => Err(Error::ShardLoad {
                    h3_3,
                    reason: "in-flight shard load was dropped".to_string(),
                }),
            },
            _ => unreachable!(),
        }
    }

    async fn load_shard<S: SegmentSource>(
        &self,
        source: &S,
        h3_3: i32,
    ) -> Result<Arc<SegmentTable>, Error> {
        let path = self.cache_file(h3_3);
        if path.exists() {
            match block_in_place(|| SegmentTable::read_parquet_file(&path)) {
                Ok(table) => {
                    debug!("shard {}: loaded from {}", h3_3, path.display());
                    return Ok(Arc::new(table));
                }
                Err(e) => {
                    warn!(
                        "shard {}: unreadable cache file {} ({}), falling back to the segment table",
                        h3_3,
                        path.display(),
                        e
                    );
                }
            }
        }

        let table = source.segments(h3_3).await.map_err(|e| match e {
            Error::Database(_) | Error::Io(_) => Error::ShardLoad {
                h3_3,
                reason: e.to_string(),
            },
            other => other,
        })?;
        debug!("shard {}: loaded {} segments from sql", h3_3, table.len());

        if let Err(e) = block_in_place(|| self.write_cache_file(&path, &table)) {
            warn!(
                "shard {}: could not persist cache file {}: {}",
                h3_3,
                path.display(),
                e
            );
        }
        Ok(Arc::new(table))
    }

    /// write-to-temp + rename keeps cache files either complete or absent
    fn write_cache_file(&self, path: &Path, table: &SegmentTable) -> Result<(), Error> {
        let tmp = self.cache_dir.join(format!(".{}.tmp", Uuid::new_v4()));
        table.write_parquet_file(&tmp)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn cache_file(&self, h3_3: i32) -> PathBuf {
        self.cache_dir.join(format!("{h3_3}.parquet"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::segments::tests::small_table;

    struct CountingSource {
        table: SegmentTable,
        call_count: Mutex<usize>,
    }

    impl CountingSource {
        fn new(table: SegmentTable) -> Self {
            Self {
                table,
                call_count: Mutex::new(0),
            }
        }

        async fn call_count(&self) -> usize {
            *self.call_count.lock().await
        }
    }

    #[async_trait]
    impl SegmentSource for CountingSource {
        async fn segments(&self, _h3_3: i32) -> Result<SegmentTable, Error> {
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
            let mut guard = self.call_count.lock().await;
            *guard += 1;
            Ok(self.table.clone())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shard_is_fetched_once_and_cached_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let source = CountingSource::new(small_table());

        let network = RoutingNetwork::with_keys(vec![8077], dir.path()).unwrap();
        let first = network.shard(&source, 8077).await.unwrap();
        let second = network.shard(&source, 8077).await.unwrap();
        assert_eq!(source.call_count().await, 1);
        assert_eq!(first.id, second.id);
        assert!(dir.path().join("8077.parquet").exists());

        // a fresh store picks the shard up from disk without touching sql
        let reopened = RoutingNetwork::with_keys(vec![8077], dir.path()).unwrap();
        let from_disk = reopened.shard(&source, 8077).await.unwrap();
        assert_eq!(source.call_count().await, 1);
        assert_eq!(from_disk.id, first.id);
        assert_eq!(from_disk.geometry(0), first.geometry(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_requests_share_one_load() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(CountingSource::new(small_table()));
        let network = Arc::new(RoutingNetwork::with_keys(vec![8077], dir.path()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let network = network.clone();
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                network.shard(source.as_ref(), 8077).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(source.call_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keys_outside_the_geofence_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = CountingSource::new(small_table());
        let network = RoutingNetwork::with_keys(vec![8077], dir.path()).unwrap();
        assert!(matches!(
            network.shard(&source, 9999).await,
            Err(Error::BufferExceedsNetwork)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupt_cache_files_fall_back_to_the_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("8077.parquet"), b"not a parquet file").unwrap();

        let source = CountingSource::new(small_table());
        let network = RoutingNetwork::with_keys(vec![8077], dir.path()).unwrap();
        let shard = network.shard(&source, 8077).await.unwrap();
        assert_eq!(shard.len(), 2);
        assert_eq!(source.call_count().await, 1);
    }
}
