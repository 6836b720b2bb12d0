//! Stratacache Integration Tests
//!
//! Exercises the public facade end to end:
//! - Memory tier, eviction and spooling into auxiliaries
//! - Read-through promotion and expiry
//! - Single-flight computed gets
//! - Groups
//! - Zombie buffering and recovery
//! - File disk tier
//! - Region manager and dispose safety

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use stratacache::cache::{
    AuxiliaryAttributes, AuxiliaryCache, AuxiliaryKind, AuxiliaryStatus, CacheAccess, CacheElement,
    CompositeCache, CompositeCacheAttributes, ElementAttributes, ElementEvent, ElementEventKind,
    EvictionPolicy, InMemoryAuxiliary, Propagation,
};
use stratacache::Error;

type Aux = Arc<InMemoryAuxiliary<String, String>>;

fn key(k: &str) -> String {
    k.to_string()
}

fn region(name: &str, max_objects: usize) -> CacheAccess<String, String> {
    let cache = CompositeCache::new(
        CompositeCacheAttributes::named(name).with_max_objects(max_objects),
        ElementAttributes::new(),
    )
    .unwrap();
    CacheAccess::new(cache)
}

fn region_with(
    attributes: CompositeCacheAttributes,
    auxiliaries: Vec<(Aux, AuxiliaryAttributes)>,
) -> CacheAccess<String, String> {
    let auxiliaries = auxiliaries
        .into_iter()
        .map(|(aux, attrs)| (aux as Arc<dyn AuxiliaryCache<String, String>>, attrs))
        .collect();
    let cache = CompositeCache::with_auxiliaries(attributes, ElementAttributes::new(), auxiliaries).unwrap();
    CacheAccess::new(cache)
}

fn disk_aux(name: &str) -> (Aux, AuxiliaryAttributes) {
    (
        Arc::new(InMemoryAuxiliary::new(name)),
        AuxiliaryAttributes::new(name, AuxiliaryKind::Disk),
    )
}

// =============================================================================
// Memory Tier and Eviction
// =============================================================================

mod memory_tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let cache = region("idempotent", 10);
        cache.put(key("k"), key("v")).await.unwrap();

        cache.remove(&key("k")).await.unwrap();
        assert_eq!(cache.get(&key("k")).await.unwrap(), None);
        cache.remove(&key("k")).await.unwrap();
        assert_eq!(cache.get(&key("k")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sessions_lru_scenario() {
        let cache = region_with(
            CompositeCacheAttributes {
                eviction_policy: EvictionPolicy::Lru,
                ..CompositeCacheAttributes::named("sessions").with_max_objects(2)
            },
            Vec::new(),
        );
        cache.put(key("A"), key("a")).await.unwrap();
        cache.put(key("B"), key("b")).await.unwrap();
        cache.put(key("C"), key("c")).await.unwrap();

        assert_eq!(cache.get(&key("A")).await.unwrap(), None);
        assert_eq!(cache.get(&key("B")).await.unwrap(), Some(key("b")));
        assert_eq!(cache.get(&key("C")).await.unwrap(), Some(key("c")));

        let stats = cache.get_statistics();
        assert_eq!(stats.counter("HitCountRam"), Some(2));
        assert_eq!(stats.counter("MissCountNotFound"), Some(1));
    }

    #[tokio::test]
    async fn test_overflow_spools_and_promotes_back() {
        let (disk, attrs) = disk_aux("disk");
        let cache = region_with(
            CompositeCacheAttributes::named("overflow").with_max_objects(5),
            vec![(disk.clone(), attrs)],
        );

        for i in 0..8 {
            cache.put(format!("k{}", i), format!("v{}", i)).await.unwrap();
        }
        let memory = cache.cache_control().memory();
        assert_eq!(memory.len(), 5);
        for i in 0..3 {
            let k = format!("k{}", i);
            assert!(memory.get_quiet(&k).is_none());
            assert!(disk.contains(&k));
        }

        for i in 0..3 {
            let k = format!("k{}", i);
            assert_eq!(cache.get(&k).await.unwrap(), Some(format!("v{}", i)));
        }
        assert!(memory.get_quiet(&key("k2")).is_some());
        assert_eq!(memory.len(), 5);
        assert_eq!(cache.get_statistics().counter("HitCountAux"), Some(3));
    }

    #[tokio::test]
    async fn test_free_memory_elements_spools() {
        let (disk, attrs) = disk_aux("disk");
        let cache = region_with(
            CompositeCacheAttributes::named("free").with_max_objects(10),
            vec![(disk.clone(), attrs)],
        );
        for i in 0..4 {
            cache.put(format!("k{}", i), key("v")).await.unwrap();
        }

        assert_eq!(cache.free_memory_elements(3).await.unwrap(), 3);
        assert_eq!(cache.cache_control().memory().len(), 1);
        assert_eq!(disk.len(), 3);
    }
}

// =============================================================================
// Read-Through and Expiry
// =============================================================================

mod read_through_tests {
    use super::*;

    #[tokio::test]
    async fn test_auxiliary_hit_is_promoted() {
        let (disk, attrs) = disk_aux("disk");
        disk.insert(CacheElement::new("promote", key("K"), key("from-disk"), ElementAttributes::new()));
        let cache = region_with(
            CompositeCacheAttributes::named("promote").with_max_objects(10),
            vec![(disk, attrs)],
        );

        assert!(cache.cache_control().memory().get_quiet(&key("K")).is_none());
        assert_eq!(cache.get(&key("K")).await.unwrap(), Some(key("from-disk")));
        assert!(cache.cache_control().memory().get_quiet(&key("K")).is_some());

        cache.get(&key("K")).await.unwrap();
        let stats = cache.get_statistics();
        assert_eq!(stats.counter("HitCountAux"), Some(1));
        assert_eq!(stats.counter("HitCountRam"), Some(1));
    }

    #[tokio::test]
    async fn test_is_expired_boundaries() {
        let cache = region("expiry", 10);
        let element = CacheElement::new("expiry", key("k"), key("v"), ElementAttributes::new().with_max_life(1));
        let now = element.attributes().create_time();
        let region = cache.cache_control();

        assert!(region.is_expired(
            &element,
            now + 2000,
            ElementEventKind::ExceededMaxLifeOnRequest,
            ElementEventKind::ExceededIdleTimeOnRequest,
        ));
        assert!(!region.is_expired(
            &element,
            now + 500,
            ElementEventKind::ExceededMaxLifeOnRequest,
            ElementEventKind::ExceededIdleTimeOnRequest,
        ));
    }

    #[tokio::test]
    async fn test_expired_element_is_not_returned() {
        let cache = region("expired", 10);
        cache
            .put_with_attributes(key("k"), key("v"), ElementAttributes::new().with_max_life(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.get(&key("k")).await.unwrap(), None);
        assert_eq!(cache.get_statistics().counter("MissCountExpired"), Some(1));
        assert!(cache.cache_control().memory().is_empty());
    }

    #[tokio::test]
    async fn test_expired_auxiliary_hit_counts_as_expired_miss() {
        let (disk, attrs) = disk_aux("disk");
        let mut attributes = ElementAttributes::new().with_max_life(1);
        attributes.set_create_time(attributes.create_time().saturating_sub(5_000));
        disk.insert(CacheElement::new("aux-expired", key("old"), key("v"), attributes));

        let cache = region_with(
            CompositeCacheAttributes::named("aux-expired").with_max_objects(10),
            vec![(disk.clone(), attrs)],
        );
        assert_eq!(cache.get(&key("old")).await.unwrap(), None);
        assert_eq!(cache.get_statistics().counter("MissCountExpired"), Some(1));
        assert!(!disk.contains(&key("old")));
    }

    #[tokio::test]
    async fn test_element_events_delivered() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |event: &ElementEvent| sink.lock().push(event.kind);

        let cache = region("events", 1);
        cache
            .set_default_element_attributes(ElementAttributes::new().with_event_handler(Arc::new(handler)))
            .unwrap();
        cache.put(key("a"), key("1")).await.unwrap();
        cache.put(key("b"), key("2")).await.unwrap();

        for _ in 0..50 {
            if !seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.lock().as_slice(), &[ElementEventKind::SpooledDiskNotAvailable]);
    }
}

// =============================================================================
// Single-Flight Computed Gets
// =============================================================================

mod single_flight_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_misses_run_supplier_once() {
        let cache = region("flight", 100);
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_with(key("missing"), || async move {
                            let n = calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(format!("computed-{}", n))
                        })
                        .await
                })
            })
            .collect();

        let mut values = Vec::new();
        for task in tasks {
            values.push(task.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| v == "computed-0"));
    }

    #[tokio::test]
    async fn test_failing_supplier_releases_waiters() {
        let cache = region("flight-fail", 100);

        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_with(key("k"), || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(Error::Management("source offline".into()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let follower = cache.get_with(key("k"), || async { Ok(key("unused")) }).await;

        assert_matches!(leader.await.unwrap(), Err(Error::Management(_)));
        assert_matches!(follower, Err(Error::LoaderFailed(message)) if message.contains("source offline"));

        let retry = cache.get_with(key("k"), || async { Ok(key("second")) }).await.unwrap();
        assert_eq!(retry, "second");
    }
}

// =============================================================================
// Groups
// =============================================================================

mod group_tests {
    use super::*;
    use stratacache::cache::{GroupAttrName, GroupCacheAccess};

    #[tokio::test]
    async fn test_group_keys_and_invalidation() {
        let cache = CompositeCache::<GroupAttrName<String>, String>::new(
            CompositeCacheAttributes::named("groups"),
            ElementAttributes::new(),
        )
        .unwrap();
        let groups = GroupCacheAccess::new(CacheAccess::new(cache));

        groups.put_in_group(key("k1"), "g", key("v1")).await.unwrap();
        groups.put_in_group(key("k2"), "g", key("v2")).await.unwrap();
        groups.put_in_group(key("k1"), "other", key("x")).await.unwrap();

        let keys = groups.get_group_keys("g").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("k1") && keys.contains("k2"));

        groups.invalidate_group("g").await.unwrap();
        assert_eq!(groups.get_from_group(key("k1"), "g").await.unwrap(), None);
        assert_eq!(groups.get_from_group(key("k1"), "other").await.unwrap(), Some(key("x")));
    }
}

// =============================================================================
// Auxiliary Degradation
// =============================================================================

mod zombie_tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_auxiliary_buffers_then_recovers() {
        let remote: Aux = Arc::new(InMemoryAuxiliary::new("remote"));
        let cache = region_with(
            CompositeCacheAttributes::named("zombie"),
            vec![(remote.clone(), AuxiliaryAttributes::new("remote", AuxiliaryKind::Remote))],
        );

        remote.set_status(AuxiliaryStatus::Error);
        cache.put(key("a"), key("1")).await.unwrap();
        cache.put(key("b"), key("2")).await.unwrap();
        cache.remove(&key("a")).await.unwrap();

        let handle = &cache.cache_control().auxiliaries()[0];
        assert_eq!(handle.zombie_queue_len(), 3);
        assert_eq!(cache.get(&key("b")).await.unwrap(), Some(key("2")));

        remote.set_status(AuxiliaryStatus::Alive);
        assert_eq!(handle.recover().await, 3);
        assert!(!remote.contains(&key("a")));
        assert!(remote.contains(&key("b")));
        assert_eq!(handle.zombie_queue_len(), 0);
    }

    #[tokio::test]
    async fn test_zombie_queue_bound_drops_oldest() {
        let remote: Aux = Arc::new(InMemoryAuxiliary::new("remote"));
        let cache = region_with(
            CompositeCacheAttributes::named("bounded"),
            vec![(
                remote.clone(),
                AuxiliaryAttributes::new("remote", AuxiliaryKind::Remote).with_zombie_queue_max_size(2),
            )],
        );
        remote.set_status(AuxiliaryStatus::Error);
        for i in 0..5 {
            cache.put(format!("k{}", i), key("v")).await.unwrap();
        }

        let handle = &cache.cache_control().auxiliaries()[0];
        assert_eq!(handle.zombie_queue_len(), 2);
        assert_eq!(handle.dropped_count(), 3);

        remote.set_status(AuxiliaryStatus::Alive);
        handle.recover().await;
        assert!(remote.contains(&key("k4")));
        assert!(!remote.contains(&key("k0")));
    }

    #[tokio::test]
    async fn test_async_propagation_delivers_in_order() {
        let lateral: Aux = Arc::new(InMemoryAuxiliary::new("lateral"));
        let cache = region_with(
            CompositeCacheAttributes::named("no-wait"),
            vec![(
                lateral.clone(),
                AuxiliaryAttributes::new("lateral", AuxiliaryKind::Lateral).with_propagation(Propagation::Async),
            )],
        );
        cache.put(key("k"), key("1")).await.unwrap();
        cache.remove(&key("k")).await.unwrap();
        cache.put(key("k"), key("2")).await.unwrap();

        let mut latest = None;
        for _ in 0..50 {
            latest = lateral.get(&key("k")).await.unwrap().map(|e| e.value().clone());
            if latest.as_deref() == Some("2") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(latest, Some(key("2")));
        assert_eq!(lateral.write_count(), 2);
    }
}

// =============================================================================
// File Disk Tier
// =============================================================================

mod disk_tests {
    use super::*;
    use stratacache::cache::{FileDiskCache, FileDiskCacheConfig};

    async fn open_disk(dir: &std::path::Path) -> Arc<FileDiskCache<String, String>> {
        Arc::new(
            FileDiskCache::open(FileDiskCacheConfig {
                name: "disk".into(),
                directory: dir.to_path_buf(),
                ..FileDiskCacheConfig::default()
            })
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_dispose_spools_memory_to_disk_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let disk = open_disk(dir.path()).await;
        let cache = CacheAccess::new(
            CompositeCache::with_auxiliaries(
                CompositeCacheAttributes::named("persist").with_max_objects(2),
                ElementAttributes::new(),
                vec![(
                    disk.clone() as Arc<dyn AuxiliaryCache<String, String>>,
                    AuxiliaryAttributes::new("disk", AuxiliaryKind::Disk),
                )],
            )
            .unwrap(),
        );

        for i in 0..4 {
            cache.put(format!("k{}", i), "x".repeat(1024)).await.unwrap();
        }
        assert_eq!(disk.len(), 2);
        cache.dispose().await.unwrap();

        let reopened = open_disk(dir.path()).await;
        assert_eq!(reopened.len(), 4);
        let element = reopened.get(&key("k3")).await.unwrap().unwrap();
        assert_eq!(element.value().len(), 1024);
    }
}

// =============================================================================
// Manager and Lifecycle
// =============================================================================

mod lifecycle_tests {
    use super::*;
    use stratacache::{CacheManager, ManagerConfig};

    #[tokio::test]
    async fn test_dispose_during_inflight_operations() {
        let cache = region("racing", 20);
        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for j in 0..20 {
                        let k = format!("k{}", (i + j) % 30);
                        let put = cache.put(k.clone(), key("v")).await;
                        let get = cache.get(&k).await;
                        for outcome in [put.map(|_| ()), get.map(|_| ())] {
                            if let Err(e) = outcome {
                                assert_matches!(e, Error::RegionDisposed(_));
                                return;
                            }
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(5)).await;
        tokio::time::timeout(Duration::from_secs(5), cache.dispose())
            .await
            .expect("dispose deadlocked")
            .unwrap();

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("operation deadlocked")
                .unwrap();
        }
        assert_matches!(cache.get(&key("k1")).await, Err(Error::RegionDisposed(_)));
        assert_matches!(cache.put(key("k1"), key("v")).await, Err(Error::RegionDisposed(_)));
        assert!(cache.get_stats().contains("DISPOSED"));
    }

    #[tokio::test]
    async fn test_manager_regions_and_stats() {
        let config = ManagerConfig::from_yaml(
            r#"
regions:
  sessions:
    cache_attributes:
      max_objects: 2
"#,
        )
        .unwrap();
        let manager = CacheManager::with_config(config).unwrap();

        let sessions = manager.get_cache::<String, String>("sessions").unwrap();
        for k in ["A", "B", "C"] {
            sessions.put(key(k), key(k)).await.unwrap();
        }
        assert_eq!(sessions.cache_control().memory().len(), 2);

        let groups = manager.get_group_cache::<String, u64>("counters").unwrap();
        groups.put_in_group(key("hits"), "web", 1).await.unwrap();

        let stats = manager.statistics();
        assert_eq!(
            stats.iter().map(|s| s.region_name.as_str()).collect::<Vec<_>>(),
            vec!["counters", "sessions"]
        );
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("HitCountRam"));

        manager.shutdown().await.unwrap();
        assert_matches!(sessions.get(&key("A")).await, Err(Error::RegionDisposed(_)));
    }
}
