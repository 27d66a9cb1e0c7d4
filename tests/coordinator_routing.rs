//! Integration tests for coordinator routing, promotion, failover and the
//! background write-back/sync machinery.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cache_fabric::coordinator::{
    CacheCoordinator, CoordinatorConfig, SyncStrategy, WritePolicy,
};
use cache_fabric::error::CacheError;
use cache_fabric::traits::Cache;

use common::{init_tracing, key, memory_tier, value, FlakyCache};

fn coordinator(config: CoordinatorConfig) -> CacheCoordinator {
    init_tracing();
    CacheCoordinator::new(config)
}

#[tokio::test]
async fn read_through_backfills_after_promotion_threshold() {
    let config = CoordinatorConfig {
        promotion_threshold: 2,
        sync_strategy: SyncStrategy::None,
        ..CoordinatorConfig::default()
    };
    let coordinator = coordinator(config);

    let fast = memory_tier("fast");
    let slow = memory_tier("slow");
    coordinator.add_cache(fast.clone(), 0).unwrap();
    coordinator.add_cache(slow.clone(), 1).unwrap();

    // the value exists only in the slower tier
    let k = key("ticker", "btc-usd");
    slow.set(&k, value(b"42000"), Some(Duration::from_secs(600)))
        .await
        .unwrap();

    // first read: slower-tier hit, below the gate, no backfill
    assert!(coordinator.get(&k).await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fast.get(&k).await.unwrap().is_none(), "gate holds at 1 hit");

    // second read crosses the threshold and fires exactly one backfill
    assert!(coordinator.get(&k).await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let promoted = fast.get(&k).await.unwrap().expect("backfilled into fast tier");
    assert_eq!(promoted.data, b"42000".to_vec());
    // remaining TTL was carried over
    assert!(promoted.expires_at.is_some());

    // third read is served by the fast tier without touching the slow one
    let slow_hits_before = slow.statistics().hit_count();
    assert!(coordinator.get(&k).await.unwrap().is_some());
    assert_eq!(slow.statistics().hit_count(), slow_hits_before);

    assert_eq!(coordinator.stats().promotions, 1);
}

#[tokio::test]
async fn writes_and_deletes_reset_the_promotion_counter() {
    let config = CoordinatorConfig {
        promotion_threshold: 2,
        sync_strategy: SyncStrategy::None,
        ..CoordinatorConfig::default()
    };
    let coordinator = coordinator(config);
    let fast = memory_tier("fast");
    let slow = memory_tier("slow");
    coordinator.add_cache(fast.clone(), 0).unwrap();
    coordinator.add_cache(slow.clone(), 1).unwrap();

    let k = key("ticker", "eth-usd");
    slow.set(&k, value(b"1"), None).await.unwrap();

    // one slower-tier hit, then a write through the coordinator
    assert!(coordinator.get(&k).await.unwrap().is_some());
    coordinator.set(&k, value(b"2"), None).await.unwrap();
    // the write landed everywhere (write-through), so remove the fast copy
    // to force slower-tier reads again
    fast.delete(&k).await.unwrap();

    // the counter restarted: a single hit stays below the gate
    assert!(coordinator.get(&k).await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fast.get(&k).await.unwrap().is_none());
}

#[tokio::test]
async fn write_through_succeeds_while_one_tier_is_down() {
    let config = CoordinatorConfig {
        max_failures: 3,
        sync_strategy: SyncStrategy::None,
        ..CoordinatorConfig::default()
    };
    let coordinator = coordinator(config);

    let fast = memory_tier("memory");
    let flaky = Arc::new(FlakyCache::new("remote"));
    let disk_like = memory_tier("disk");
    coordinator.add_cache(fast.clone(), 0).unwrap();
    coordinator.add_cache(flaky.clone(), 1).unwrap();
    coordinator.add_cache(disk_like.clone(), 2).unwrap();

    flaky.set_failing(true);

    // writes succeed on the healthy tiers
    let k = key("orders", "o-1");
    coordinator.set(&k, value(b"fill"), None).await.unwrap();
    assert!(fast.get(&k).await.unwrap().is_some());
    assert!(disk_like.get(&k).await.unwrap().is_some());

    // three consecutive failures exclude the tier from routing
    for _ in 0..2 {
        coordinator.set(&k, value(b"fill"), None).await.unwrap();
    }
    let remote = coordinator
        .tiers()
        .into_iter()
        .find(|tier| tier.name() == "remote")
        .unwrap();
    assert!(!remote.is_healthy());

    // keys() no longer consults the excluded tier
    let keys = coordinator.keys(None).await.unwrap();
    assert_eq!(keys.len(), 1);

    // a successful health check readmits it
    flaky.set_failing(false);
    coordinator.health_check().await;
    assert!(remote.is_healthy());
    assert_eq!(remote.consecutive_failures(), 0);
}

#[tokio::test]
async fn all_tiers_failing_surfaces_the_error() {
    let coordinator = coordinator(CoordinatorConfig {
        enable_failover: false,
        sync_strategy: SyncStrategy::None,
        ..CoordinatorConfig::default()
    });
    let flaky = Arc::new(FlakyCache::new("remote"));
    flaky.set_failing(true);
    coordinator.add_cache(flaky, 0).unwrap();

    let k = key("ticker", "btc-usd");
    assert!(matches!(
        coordinator.get(&k).await,
        Err(CacheError::Io(_))
    ));
    assert!(matches!(
        coordinator.set(&k, value(b"x"), None).await,
        Err(CacheError::Io(_))
    ));
}

#[tokio::test]
async fn write_around_targets_the_slowest_tier() {
    let coordinator = coordinator(CoordinatorConfig {
        write_policy: WritePolicy::WriteAround,
        sync_strategy: SyncStrategy::None,
        ..CoordinatorConfig::default()
    });
    let fast = memory_tier("fast");
    let slow = memory_tier("slow");
    coordinator.add_cache(fast.clone(), 0).unwrap();
    coordinator.add_cache(slow.clone(), 1).unwrap();

    let k = key("ticker", "sol-usd");
    coordinator.set(&k, value(b"150"), None).await.unwrap();

    assert!(fast.get(&k).await.unwrap().is_none());
    assert!(slow.get(&k).await.unwrap().is_some());
}

#[tokio::test]
async fn write_back_propagates_asynchronously() {
    let coordinator = coordinator(CoordinatorConfig {
        write_policy: WritePolicy::WriteBack,
        sync_strategy: SyncStrategy::None,
        ..CoordinatorConfig::default()
    });
    let fast = memory_tier("fast");
    let slow = memory_tier("slow");
    coordinator.add_cache(fast.clone(), 0).unwrap();
    coordinator.add_cache(slow.clone(), 1).unwrap();
    coordinator.start().await.unwrap();

    let k = key("ticker", "ada-usd");
    coordinator.set(&k, value(b"0.5"), None).await.unwrap();

    // synchronous on the fastest tier
    assert!(fast.get(&k).await.unwrap().is_some());
    // eventually on the slower one
    let mut propagated = false;
    for _ in 0..50 {
        if slow.get(&k).await.unwrap().is_some() {
            propagated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(propagated, "write-back reached the slower tier");

    coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn periodic_sync_pushes_authoritative_entries_forward() {
    let coordinator = coordinator(CoordinatorConfig {
        sync_strategy: SyncStrategy::Periodic,
        sync_interval: Duration::from_millis(50),
        enable_promotion: false,
        ..CoordinatorConfig::default()
    });
    let fast = memory_tier("fast");
    let slow = memory_tier("slow");
    coordinator.add_cache(fast.clone(), 0).unwrap();
    coordinator.add_cache(slow.clone(), 1).unwrap();
    coordinator.start().await.unwrap();

    // the slow tier is authoritative; a directly-written entry appears in
    // the fast tier within a few sync intervals
    let k = key("ticker", "dot-usd");
    slow.set(&k, value(b"7"), Some(Duration::from_secs(300)))
        .await
        .unwrap();

    let mut synced = false;
    for _ in 0..50 {
        if fast.get(&k).await.unwrap().is_some() {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(synced, "periodic sync refreshed the faster tier");

    coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn exists_keys_and_size_merge_across_tiers() {
    let coordinator = coordinator(CoordinatorConfig {
        sync_strategy: SyncStrategy::None,
        ..CoordinatorConfig::default()
    });
    let fast = memory_tier("fast");
    let slow = memory_tier("slow");
    coordinator.add_cache(fast.clone(), 0).unwrap();
    coordinator.add_cache(slow.clone(), 1).unwrap();

    let only_fast = key("ticker", "a");
    let only_slow = key("ticker", "b");
    let both = key("ticker", "c");
    fast.set(&only_fast, value(b"1"), None).await.unwrap();
    slow.set(&only_slow, value(b"2"), None).await.unwrap();
    fast.set(&both, value(b"3"), None).await.unwrap();
    slow.set(&both, value(b"3"), None).await.unwrap();

    assert!(coordinator.exists(&only_fast).await.unwrap());
    assert!(coordinator.exists(&only_slow).await.unwrap());
    assert!(!coordinator.exists(&key("ticker", "zz")).await.unwrap());

    // union deduplicated by hash-key
    let keys = coordinator.keys(Some("ticker:*")).await.unwrap();
    assert_eq!(keys.len(), 3);

    // size is the maximum across tiers, not the sum
    assert_eq!(coordinator.size().await.unwrap(), 2);

    assert!(coordinator.delete(&both).await.unwrap());
    assert!(fast.get(&both).await.unwrap().is_none());
    assert!(slow.get(&both).await.unwrap().is_none());

    coordinator.clear().await.unwrap();
    assert_eq!(coordinator.size().await.unwrap(), 0);
}

#[tokio::test]
async fn increment_applies_once_on_the_authoritative_tier() {
    let coordinator = coordinator(CoordinatorConfig {
        sync_strategy: SyncStrategy::None,
        ..CoordinatorConfig::default()
    });
    let fast = memory_tier("fast");
    let slow = memory_tier("slow");
    coordinator.add_cache(fast.clone(), 0).unwrap();
    coordinator.add_cache(slow.clone(), 1).unwrap();

    let k = key("counters", "requests");
    assert_eq!(coordinator.increment(&k, 5).await.unwrap(), 5);
    assert_eq!(coordinator.increment(&k, 5).await.unwrap(), 10);

    // the slowest tier holds the authoritative count
    let stored = slow.get(&k).await.unwrap().unwrap();
    assert_eq!(stored.data, b"10".to_vec());
    // faster copies were invalidated rather than double-applied
    assert!(fast.get(&k).await.unwrap().is_none());
}

#[tokio::test]
async fn get_or_set_runs_the_fill_exactly_once_under_contention() {
    let coordinator = Arc::new(coordinator(CoordinatorConfig {
        sync_strategy: SyncStrategy::None,
        ..CoordinatorConfig::default()
    }));
    coordinator.add_cache(memory_tier("fast"), 0).unwrap();

    let fills = Arc::new(AtomicU32::new(0));
    let k = key("ticker", "expensive");

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..20 {
        let coordinator = Arc::clone(&coordinator);
        let fills = Arc::clone(&fills);
        let k = k.clone();
        tasks.spawn(async move {
            coordinator
                .get_or_set(
                    &k,
                    Some(Duration::from_secs(60)),
                    Box::new(move || {
                        Box::pin(async move {
                            fills.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(b"computed".to_vec())
                        })
                    }),
                )
                .await
        });
    }
    while let Some(result) = tasks.join_next().await {
        let value = result.unwrap().unwrap();
        assert_eq!(value.data, b"computed".to_vec());
    }

    assert_eq!(fills.load(Ordering::SeqCst), 1, "fill ran exactly once");
}

#[tokio::test]
async fn stopped_coordinator_fails_fast() {
    let coordinator = coordinator(CoordinatorConfig::default());
    coordinator.add_cache(memory_tier("fast"), 0).unwrap();
    coordinator.start().await.unwrap();
    coordinator.stop().await.unwrap();

    let k = key("ticker", "btc-usd");
    assert!(matches!(
        coordinator.get(&k).await,
        Err(CacheError::ShuttingDown)
    ));
    assert!(matches!(
        coordinator.set(&k, value(b"x"), None).await,
        Err(CacheError::ShuttingDown)
    ));
}

#[tokio::test]
async fn duplicate_tier_names_are_rejected() {
    let coordinator = coordinator(CoordinatorConfig::default());
    coordinator.add_cache(memory_tier("dup"), 0).unwrap();
    let err = coordinator.add_cache(memory_tier("dup"), 1).unwrap_err();
    assert!(matches!(err, CacheError::Config(_)));
    assert!(coordinator.remove_cache("dup"));
    assert!(!coordinator.remove_cache("dup"));
}
