//! Memory-over-disk coordinator: durable entries survive a restart and
//! flow back into the fast tier through read-through promotion.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cache_fabric::backends::{DiskCache, DiskCacheConfig};
use cache_fabric::coordinator::{CacheCoordinator, CoordinatorConfig, SyncStrategy};
use cache_fabric::traits::Cache;

use common::{init_tracing, key, memory_tier, value};

fn disk_tier(dir: &std::path::Path) -> Arc<DiskCache> {
    let mut config = DiskCacheConfig::new("durable", dir);
    config.base.background_cleanup = false;
    Arc::new(DiskCache::new(config))
}

fn coordinator_over(dir: &std::path::Path) -> (CacheCoordinator, Arc<DiskCache>) {
    init_tracing();
    let coordinator = CacheCoordinator::new(CoordinatorConfig {
        promotion_threshold: 1,
        sync_strategy: SyncStrategy::None,
        ..CoordinatorConfig::default()
    });
    let disk = disk_tier(dir);
    coordinator.add_cache(memory_tier("hot"), 0).unwrap();
    coordinator.add_cache(disk.clone(), 1).unwrap();
    (coordinator, disk)
}

#[tokio::test]
async fn entries_survive_a_restart_and_promote_back() {
    let dir = tempfile::tempdir().unwrap();

    // first lifetime: write through both tiers, then shut down
    {
        let (coordinator, _) = coordinator_over(dir.path());
        coordinator.start().await.unwrap();
        let k = key("ticker", "btc-usd");
        coordinator
            .set(&k, value(b"42000"), Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        coordinator.stop().await.unwrap();
    }

    // second lifetime over the same directory: only the disk tier still
    // holds the entry; one read promotes it into the fresh memory tier
    let (coordinator, disk) = coordinator_over(dir.path());
    coordinator.start().await.unwrap();

    let k = key("ticker", "btc-usd");
    assert!(disk.get(&k).await.unwrap().is_some(), "entry loaded from index");

    let read = coordinator.get(&k).await.unwrap().unwrap();
    assert_eq!(read.data, b"42000".to_vec());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let tiers = coordinator.tiers();
    let hot = tiers.iter().find(|tier| tier.name() == "hot").unwrap();
    assert!(hot.is_healthy());
    // the hot tier now answers directly
    let disk_hits_before = disk.statistics().hit_count();
    assert!(coordinator.get(&k).await.unwrap().is_some());
    assert_eq!(disk.statistics().hit_count(), disk_hits_before);

    coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn coordinator_health_check_reports_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let (coordinator, _) = coordinator_over(dir.path());
    coordinator.start().await.unwrap();

    let reports = coordinator.health_check().await;
    assert_eq!(reports.len(), 2);
    for (name, report) in &reports {
        assert!(report.healthy, "tier {name} healthy");
    }

    coordinator.stop().await.unwrap();
}
