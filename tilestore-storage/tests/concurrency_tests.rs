// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Concurrent writers, lost compare-and-swaps and partial batch failures.

mod common;

use common::*;
use std::collections::HashSet;
use std::sync::Arc;
use tilestore_core::{DigestSet, ParamSet, TileStoreError, TraceStoreConfig};
use tilestore_storage::{
    ConflictRetry, DigestMapManager, IdPool, InMemoryStore, OpsCache, OpsManager,
    ShardedTraceStore, StoreStatsAtomic, TileKey, TraceStore,
};

fn ops_manager(store: Arc<YieldingStore>) -> OpsManager {
    let config = TraceStoreConfig::for_testing(10);
    OpsManager::new(
        store,
        Some(Arc::new(OpsCache::new(8))),
        config.write_timeout(),
        ConflictRetry::from_config(&config),
        Arc::new(StoreStatsAtomic::new()),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ops_growth_loses_nothing() {
    let mem = Arc::new(InMemoryStore::new());
    let store = Arc::new(YieldingStore { inner: mem });
    let tile = TileKey(u32::MAX);
    let writers = 8;

    let mut handles = Vec::new();
    for i in 0..writers {
        let manager = ops_manager(store.clone());
        handles.push(tokio::spawn(async move {
            let mut ps = ParamSet::new();
            ps.add(&format!("key{}", i), &format!("value{}", i));
            ps.add("shared", &format!("s{}", i));
            manager.update(tile, &ps).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let reader = ops_manager(store);
    let (entry, exists) = reader.get(tile).await.unwrap();
    assert!(exists);
    for i in 0..writers {
        assert!(
            entry.ops.code_of(&format!("key{}", i), &format!("value{}", i)).is_some(),
            "lost key{}",
            i
        );
        assert!(entry.ops.code_of("shared", &format!("s{}", i)).is_some());
    }
    assert_eq!(entry.ops.key_order().len(), writers + 1);
}

#[tokio::test]
async fn test_put_survives_lost_cas() {
    let mem = Arc::new(InMemoryStore::new());
    let store = Arc::new(CasLosingStore::new(mem.clone(), 3));
    let ts = trace_store(10, 4, store.clone());

    // Three lost creates before the OPS row is written, then a clean CAS.
    ts.put("c0", &[entry(&[("test", "a")], "aaa111")], base_time())
        .await
        .unwrap();
    ts.put("c1", &[entry(&[("test", "b")], "bbb222")], base_time())
        .await
        .unwrap();

    let stats = ts.stats();
    assert_eq!(stats.ops_conflicts, 3);
    assert_eq!(stats.ops_updates, 2);

    let (tile, _) = ts.get_tile(4, deadline()).await.unwrap();
    assert_eq!(tile.traces.get(",test=a,").unwrap().digests[0], "aaa111");
    assert_eq!(tile.traces.get(",test=b,").unwrap().digests[1], "bbb222");
}

#[tokio::test]
async fn test_pathological_contention_gives_up() {
    let mem = Arc::new(InMemoryStore::new());
    let store = Arc::new(CasLosingStore::new(mem, u32::MAX));
    let config = TraceStoreConfig {
        max_conflict_retries: 4,
        ..TraceStoreConfig::for_testing(10)
    };
    let ts = ShardedTraceStore::new(config, store, history(2)).unwrap();
    let err = ts
        .put("c0", &[entry(&[("test", "a")], "aaa111")], base_time())
        .await
        .unwrap_err();
    assert!(matches!(err, TileStoreError::Contention { attempts: 4, .. }));
    assert!(err.is_retryable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_same_tile() {
    let mem = Arc::new(InMemoryStore::new());
    let store = Arc::new(YieldingStore { inner: mem });
    let hist = history(6);

    let mut handles = Vec::new();
    for w in 0..6usize {
        let ts = ShardedTraceStore::new(
            TraceStoreConfig::for_testing(10),
            store.clone(),
            hist.clone(),
        )
        .unwrap();
        handles.push(tokio::spawn(async move {
            let writer = w.to_string();
            let entries = vec![
                entry(&[("writer", writer.as_str()), ("test", "x")], &format!("w{}d{}", w, w)),
                entry(&[("writer", writer.as_str()), ("test", "shared")], "shared0"),
            ];
            ts.put(&format!("c{}", w), &entries, base_time()).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let reader = ShardedTraceStore::new(TraceStoreConfig::for_testing(10), store, hist).unwrap();
    let (tile, _) = reader.get_tile(6, deadline()).await.unwrap();
    assert_eq!(tile.traces.len(), 12);
    for w in 0..6usize {
        let x = tile
            .traces
            .get(&format!(",test=x,writer={},", w))
            .unwrap();
        assert_eq!(x.digests[w], format!("w{}d{}", w, w));
        let shared = tile
            .traces
            .get(&format!(",test=shared,writer={},", w))
            .unwrap();
        assert_eq!(shared.digests[w], "shared0");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_digest_ids_are_injective_across_processes() {
    let mem = Arc::new(InMemoryStore::new());
    let store = Arc::new(YieldingStore { inner: mem });
    let config = TraceStoreConfig::for_testing(10);

    let mut handles = Vec::new();
    for p in 0..5u32 {
        let manager = DigestMapManager::new(
            store.clone(),
            Arc::new(IdPool::new()),
            config.shards,
            config.reserved_ids,
            config.write_timeout(),
            ConflictRetry::from_config(&config),
            Arc::new(StoreStatsAtomic::new()),
        );
        handles.push(tokio::spawn(async move {
            // Overlapping sets: every digest is wanted by two processes.
            let digests: DigestSet = (0..20u32)
                .map(|d| format!("dg{:04}", (p * 10 + d) % 50))
                .collect();
            let map = manager.ensure(&digests).await?;
            let again = manager.ensure(&digests).await?;
            for d in &digests {
                assert_eq!(map.id(d)?, again.id(d)?);
            }
            Ok::<_, TileStoreError>(())
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let checker = DigestMapManager::new(
        store,
        Arc::new(IdPool::new()),
        config.shards,
        config.reserved_ids,
        config.write_timeout(),
        ConflictRetry::from_config(&config),
        Arc::new(StoreStatsAtomic::new()),
    );
    let map = checker.load().await.unwrap();
    assert_eq!(map.len(), 50);
    let mut seen = HashSet::new();
    for d in 0..50 {
        let id = map.id(&format!("dg{:04}", d)).unwrap();
        assert!(!id.is_missing());
        assert!(seen.insert(id), "id {} assigned twice", id);
    }
}

#[tokio::test]
async fn test_partial_batch_failure_reports_ranges() {
    let mem = Arc::new(InMemoryStore::new());
    let store = Arc::new(FailingBulkStore {
        inner: mem,
        fail_len: 5,
        reject_rows: false,
    });
    let config = TraceStoreConfig {
        max_batch_size: 10,
        ..TraceStoreConfig::for_testing(10)
    };
    let ts = ShardedTraceStore::new(config, store, history(2)).unwrap();
    let entries: Vec<_> = (0..25)
        .map(|i| entry(&[("test", format!("t{:02}", i).as_str())], &format!("dig{:03}", i)))
        .collect();

    let err = ts.put("c1", &entries, base_time()).await.unwrap_err();
    match &err {
        TileStoreError::BatchWrite {
            total_batches,
            failures,
        } => {
            assert_eq!(*total_batches, 3);
            assert_eq!(failures.len(), 1);
            assert_eq!((failures[0].start, failures[0].end), (20, 25));
            assert!(failures[0].reason.contains("unavailable"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.is_retryable());

    // The other batches were applied and are readable.
    let (tile, _) = ts.get_tile(2, deadline()).await.unwrap();
    let written = tile
        .traces
        .iter()
        .filter(|(_, t)| !t.is_missing(1))
        .count();
    assert_eq!(written, 20);
    let stats = ts.stats();
    assert_eq!((stats.batches_applied, stats.batches_failed), (2, 1));
    assert_eq!(stats.puts, 0);
}

#[tokio::test]
async fn test_rejected_rows_fail_their_batch() {
    let mem = Arc::new(InMemoryStore::new());
    let store = Arc::new(FailingBulkStore {
        inner: mem,
        fail_len: 3,
        reject_rows: true,
    });
    let config = TraceStoreConfig {
        max_batch_size: 4,
        ..TraceStoreConfig::for_testing(10)
    };
    let ts = ShardedTraceStore::new(config, store, history(1)).unwrap();
    let entries: Vec<_> = (0..7)
        .map(|i| entry(&[("test", format!("t{}", i).as_str())], &format!("dig{:03}", i)))
        .collect();

    match ts.put("c0", &entries, base_time()).await {
        Err(TileStoreError::BatchWrite { failures, .. }) => {
            assert_eq!((failures[0].start, failures[0].end), (4, 7));
            assert!(failures[0].reason.contains("3 rows rejected"));
        }
        other => panic!("unexpected result {:?}", other),
    }
}
