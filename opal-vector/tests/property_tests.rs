//! Property-based tests for the vector index
//!
//! Uses proptest to verify index invariants with random inputs

use opal_vector::{HnswConfig, VectorIndex, normalized};
use proptest::prelude::*;
use std::collections::HashSet;

/// Strategy for generating unit vectors of a fixed dimension
fn unit_vector_strategy(dim: usize) -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-1.0f64..1.0f64, dim..=dim)
        .prop_filter("zero vectors cannot be normalized", |v| {
            v.iter().any(|x| x.abs() > 1e-3)
        })
        .prop_map(|v| normalized(&v))
}

/// Strategy for keyed batches of unit vectors with unique keys
fn keyed_vectors(dim: usize, max: usize) -> impl Strategy<Value = Vec<(String, Vec<f64>)>> {
    prop::collection::btree_map("[a-z]{1,8}", unit_vector_strategy(dim), 1..max)
        .prop_map(|m| m.into_iter().collect())
}

fn test_config() -> HnswConfig {
    HnswConfig {
        seed: 7,
        use_persistence: false,
        ..HnswConfig::default()
    }
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("Failed to build runtime")
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: every inserted vector is its own nearest neighbor at the
    /// configured rounding precision.
    #[test]
    fn prop_self_is_nearest(batch in keyed_vectors(8, 30)) {
        block_on(async {
            let index = VectorIndex::in_memory(test_config());
            for (key, vector) in &batch {
                index.insert(key, vector.clone(), None).await.unwrap();
            }
            for (key, vector) in &batch {
                let result = index.query(vector, Some(1)).await.unwrap();
                prop_assert_eq!(&result.keys[0], key);
                prop_assert!(result.distances[0] <= 1e-6);
            }
            Ok(())
        })?;
    }

    /// Property: a soft-deleted key never appears in query results; after
    /// undeletion it may again.
    #[test]
    fn prop_deleted_keys_never_returned(batch in keyed_vectors(8, 20), victim_idx in any::<prop::sample::Index>()) {
        block_on(async {
            let index = VectorIndex::in_memory(test_config());
            for (key, vector) in &batch {
                index.insert(key, vector.clone(), None).await.unwrap();
            }

            let (victim, victim_vector) = victim_idx.get(&batch).clone();
            index.mark_deleted(&victim).await.unwrap();

            if batch.len() > 1 {
                let result = index.query(&victim_vector, None).await.unwrap();
                prop_assert!(!result.keys.contains(&victim));

                index.unmark_deleted(&victim).await.unwrap();
                let result = index.query(&victim_vector, Some(1)).await.unwrap();
                prop_assert_eq!(&result.keys[0], &victim);
            }
            Ok(())
        })?;
    }

    /// Property: queries return at most k results, sorted by ascending
    /// distance.
    #[test]
    fn prop_query_bounded_and_sorted(
        batch in keyed_vectors(8, 40),
        query in unit_vector_strategy(8),
        k in 1usize..15
    ) {
        block_on(async {
            let index = VectorIndex::in_memory(test_config());
            for (key, vector) in &batch {
                index.insert(key, vector.clone(), None).await.unwrap();
            }

            let result = index.query(&query, Some(k)).await.unwrap();
            prop_assert!(result.keys.len() <= k);
            prop_assert_eq!(result.keys.len(), result.distances.len());
            for pair in result.distances.windows(2) {
                prop_assert!(pair[0] <= pair[1]);
            }
            Ok(())
        })?;
    }

    /// Property: neighbor counts never exceed m per layer (m_max_0 at
    /// layer 0), whatever the insertion order.
    #[test]
    fn prop_neighbor_caps(batch in keyed_vectors(6, 40)) {
        block_on(async {
            let config = HnswConfig {
                m: 4,
                m_max_0: 8,
                ..test_config()
            };
            let index = VectorIndex::in_memory(config);
            for (key, vector) in &batch {
                index.insert(key, vector.clone(), None).await.unwrap();
            }

            let snapshot = index.export().await.unwrap();
            for (layer_idx, layer) in snapshot.layers.iter().enumerate() {
                let cap = if layer_idx == 0 { 8 } else { 4 };
                for key in layer.keys() {
                    let count = layer.neighbors(key).map(|n| n.len()).unwrap_or(0);
                    prop_assert!(count <= cap);
                }
            }
            Ok(())
        })?;
    }

    /// Property: compaction preserves exactly the live keys and their
    /// vectors.
    #[test]
    fn prop_compact_preserves_live_set(batch in keyed_vectors(6, 25), delete_count in 0usize..10) {
        block_on(async {
            let index = VectorIndex::in_memory(test_config());
            for (key, vector) in &batch {
                index.insert(key, vector.clone(), None).await.unwrap();
            }

            let deleted: HashSet<String> = batch
                .iter()
                .take(delete_count.min(batch.len().saturating_sub(1)))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &deleted {
                index.mark_deleted(key).await.unwrap();
            }

            index.compact().await.unwrap();

            let stats = index.stats().await.unwrap();
            prop_assert_eq!(stats.total_nodes, batch.len() - deleted.len());
            prop_assert_eq!(stats.deleted_nodes, 0);

            for (key, vector) in &batch {
                if deleted.contains(key) {
                    prop_assert!(!index.contains(key).await.unwrap());
                } else {
                    let result = index.query(vector, Some(1)).await.unwrap();
                    prop_assert_eq!(&result.keys[0], key);
                }
            }
            Ok(())
        })?;
    }

    /// Property: re-inserting a live key always fails with Duplicate.
    #[test]
    fn prop_reinsert_live_key_rejected(batch in keyed_vectors(4, 10)) {
        block_on(async {
            let index = VectorIndex::in_memory(test_config());
            for (key, vector) in &batch {
                index.insert(key, vector.clone(), None).await.unwrap();
            }
            for (key, vector) in &batch {
                let err = index.insert(key, vector.clone(), None).await.unwrap_err();
                prop_assert!(matches!(err, opal_vector::VectorError::Duplicate(_)));
            }
            Ok(())
        })?;
    }
}
