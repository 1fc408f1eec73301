//! Integration tests for kvgen-kv.
//!
//! Validates:
//! - Chunked writes produce the same cache state as token-by-token appends
//! - Capacity plans applied to a real cache keep it within bounds
//! - The frozen anchor survives any number of evictions
//! - Snapshots are right-aligned and keyed per layer

use kvgen_kv::*;

fn token(value: f32, width: usize) -> Vec<f32> {
    vec![value; width]
}

/// Push one token through the capacity plan, the way the engine does.
fn write_token(cache: &mut SessionKVCache, mgr: &CapacityManager, value: f32) {
    let width = cache.n_heads() * cache.head_dim();
    if let Some(ev) = mgr.plan(cache.seq_len(), 1).unwrap() {
        cache.evict(ev.start, ev.count).unwrap();
    }
    let k: Vec<Vec<f32>> = (0..cache.n_layers()).map(|_| token(value, width)).collect();
    let v: Vec<Vec<f32>> = (0..cache.n_layers()).map(|_| token(-value, width)).collect();
    let k_refs: Vec<&[f32]> = k.iter().map(Vec::as_slice).collect();
    let v_refs: Vec<&[f32]> = v.iter().map(Vec::as_slice).collect();
    cache.append_token(&k_refs, &v_refs).unwrap();
}

fn first_entry(cache: &SessionKVCache, layer: usize) -> f32 {
    cache.layer(layer).unwrap().keys()[0]
}

// ===========================================================================
// Chunked vs sequential writes
// ===========================================================================

#[test]
fn chunked_append_matches_sequential_append() {
    let (n_heads, head_dim, n) = (2, 4, 5);
    let width = n_heads * head_dim;
    let k: Vec<f32> = (0..n * width).map(|i| i as f32 * 0.1).collect();
    let v: Vec<f32> = (0..n * width).map(|i| i as f32 * 0.2 + 1.0).collect();

    let mut chunked = LayerKVCache::new(16, n_heads, head_dim);
    chunked.append_tokens(&k[..3 * width], &v[..3 * width]).unwrap();
    chunked.append_tokens(&k[3 * width..], &v[3 * width..]).unwrap();

    let mut sequential = LayerKVCache::new(16, n_heads, head_dim);
    for t in 0..n {
        let r = t * width..(t + 1) * width;
        sequential.append_token(&k[r.clone()], &v[r]).unwrap();
    }

    assert_eq!(chunked.seq_len, sequential.seq_len);
    assert_eq!(chunked.keys(), sequential.keys());
    assert_eq!(chunked.values(), sequential.values());
}

// ===========================================================================
// Capacity management
// ===========================================================================

#[test]
fn anchor_survives_long_generation() {
    let mgr = CapacityManager::new(4, true).unwrap();
    let mut cache = SessionKVCache::new(2, 4, 1, 2);

    for step in 0..20 {
        write_token(&mut cache, &mgr, step as f32 + 1.0);
        assert!(cache.seq_len() <= 4);
    }

    assert_eq!(cache.seq_len(), 4);
    for layer in 0..2 {
        assert_eq!(first_entry(&cache, layer), 1.0);
        // Remaining slots hold the three most recent tokens, oldest first.
        let keys = cache.layer(layer).unwrap().keys();
        assert_eq!(&keys[2..], &[18.0, 18.0, 19.0, 19.0, 20.0, 20.0]);
    }
}

#[test]
fn unfrozen_cache_keeps_most_recent_window() {
    let mgr = CapacityManager::new(3, false).unwrap();
    let mut cache = SessionKVCache::new(1, 3, 1, 1);

    for step in 1..=7 {
        write_token(&mut cache, &mgr, step as f32);
    }
    assert_eq!(cache.layer(0).unwrap().keys(), &[5.0, 6.0, 7.0]);
    assert_eq!(cache.layer(0).unwrap().values(), &[-5.0, -6.0, -7.0]);
}

#[test]
fn chunk_write_after_planned_eviction_fits_exactly() {
    let mgr = CapacityManager::new(6, true).unwrap();
    let mut cache = SessionKVCache::new(1, 6, 1, 1);
    let prompt: Vec<f32> = (1..=5).map(|i| i as f32).collect();
    cache.append_tokens(&[prompt.as_slice()], &[prompt.as_slice()]).unwrap();

    let chunk = [10.0, 11.0, 12.0];
    let ev = mgr.plan(cache.seq_len(), chunk.len()).unwrap().unwrap();
    assert_eq!(ev, Eviction { start: 1, count: 2 });
    cache.evict(ev.start, ev.count).unwrap();
    cache.append_tokens(&[&chunk[..]], &[&chunk[..]]).unwrap();

    assert_eq!(cache.layer(0).unwrap().keys(), &[1.0, 4.0, 5.0, 10.0, 11.0, 12.0]);
}

#[test]
fn capacity_errors_are_flagged() {
    let too_small = CapacityManager::new(1, true).unwrap_err();
    assert!(too_small.is_capacity_error());

    let mgr = CapacityManager::new(4, false).unwrap();
    let too_large = mgr.check_chunk(5).unwrap_err();
    assert!(too_large.is_capacity_error());

    let write_err = KVError::CapacityExceeded { seq_len: 5, max: 4 };
    assert!(!write_err.is_capacity_error());
}

// ===========================================================================
// Snapshots
// ===========================================================================

#[test]
fn snapshot_is_right_aligned() {
    let mut cache = SessionKVCache::new(2, 5, 2, 1);
    // token 0: heads (1, 2); token 1: heads (3, 4)
    let k = [1.0, 2.0, 3.0, 4.0];
    let v = [5.0, 6.0, 7.0, 8.0];
    cache.append_tokens(&[&k[..], &k[..]], &[&v[..], &v[..]]).unwrap();

    let snapshot = cache.snapshot();
    let names: Vec<&str> = snapshot.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        [
            "past_key_values.0.key",
            "past_key_values.0.value",
            "past_key_values.1.key",
            "past_key_values.1.value"
        ]
    );

    let key = &snapshot["past_key_values.1.key"];
    assert_eq!(key.shape(), [1, 2, 5, 1]);
    assert_eq!(key.head_rows(0, 0, 5), Some(vec![0.0, 0.0, 0.0, 1.0, 3.0]));
    assert_eq!(key.head_rows(1, 3, 5), Some(vec![2.0, 4.0]));

    let value = &snapshot["past_key_values.0.value"];
    assert_eq!(value.head_rows(1, 3, 5), Some(vec![6.0, 8.0]));
}

#[test]
fn snapshots_of_equal_caches_are_equal() {
    let mut a = SessionKVCache::new(1, 4, 1, 2);
    let mut b = SessionKVCache::new(1, 4, 1, 2);
    let k = [0.5, 0.25, 1.5, 1.25];
    a.append_tokens(&[&k[..]], &[&k[..]]).unwrap();
    b.append_token(&[&k[..2]], &[&k[..2]]).unwrap();
    b.append_token(&[&k[2..]], &[&k[2..]]).unwrap();

    let (sa, sb) = (a.snapshot(), b.snapshot());
    for (name, tensor) in &sa {
        assert_eq!(tensor.max_abs_diff(&sb[name]), Some(0.0), "{name}");
    }
}
