//! Property tests for cache key fingerprints and invalidation patterns

use assetgate::cache::glob_prefix_match;
use assetgate::models::collect_stream;
use assetgate::{AssetCache, CacheKey, EntryInfo, GateConfig};
use bytes::Bytes;
use proptest::prelude::*;
use std::sync::Arc;

fn memory_cache() -> AssetCache {
    let mut config = GateConfig::default();
    config.caching.memory.enabled = true;
    tokio_test::block_on(AssetCache::from_config(Arc::new(config))).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// The same request always yields the same digest
    #[test]
    fn prop_key_deterministic(
        domain in proptest::option::of("[a-z]{3,10}\\.com"),
        path in "[a-z]{1,8}(/[a-z]{1,8}){0,3}\\.jpg",
        variant in "[a-z0-9:{}\",]{0,40}",
    ) {
        let a = CacheKey::new(domain.as_deref(), &path, &variant);
        let b = CacheKey::new(domain.as_deref(), &path, &variant);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.digest.len(), 32);
    }

    /// Leading slashes and host case do not change the key
    #[test]
    fn prop_key_normalized(
        domain in "[a-z]{3,10}\\.com",
        path in "[a-z]{1,8}/[a-z]{1,8}\\.png",
    ) {
        let plain = CacheKey::new(Some(&domain), &path, "image:{}");
        let slashed = CacheKey::new(Some(&domain.to_uppercase()), &format!("/{}", path), "image:{}");
        prop_assert_eq!(plain.digest, slashed.digest);
    }

    /// Different transforms of one path never share a key
    #[test]
    fn prop_variants_distinct(
        path in "[a-z]{1,8}\\.jpg",
        w1 in 1u32..5000,
        w2 in 1u32..5000,
    ) {
        prop_assume!(w1 != w2);
        let a = CacheKey::new(None, &path, &format!("image:{{\"width\":{}}}", w1));
        let b = CacheKey::new(None, &path, &format!("image:{{\"width\":{}}}", w2));
        prop_assert_ne!(a.digest, b.digest);
    }

    /// A pattern made of a path prefix plus `*` matches that path
    #[test]
    fn prop_prefix_pattern_matches(
        path in "[a-z]{1,8}(/[a-z]{1,8}){0,3}\\.jpg",
        cut in 0usize..8,
    ) {
        let cut = cut.min(path.len());
        let pattern = format!("{}*", &path[..cut]);
        prop_assert!(glob_prefix_match(&pattern, &path));
        prop_assert!(glob_prefix_match(&path, &path));
    }

    /// The caller and the cache see the same bytes however the body is chunked
    #[test]
    fn prop_tee_preserves_body(
        chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..8),
    ) {
        let cache = memory_cache();
        let key = cache.key(None, "notes/body.txt", "default:{}");
        let expected: Vec<u8> = chunks.concat();

        let (served, stored) = tokio_test::block_on(async {
            let source = Box::pin(futures::stream::iter(
                chunks.into_iter().map(|c| Ok::<_, assetgate::GateError>(Bytes::from(c))),
            ));
            let tee = cache.cache_file(source, &key, EntryInfo::new("text/plain"));
            let served = collect_stream(tee).await.unwrap();
            (served, cache.get_bytes(&key).await)
        });

        prop_assert_eq!(&served[..], &expected[..]);
        prop_assert_eq!(stored.as_deref(), Some(&expected[..]));
    }
}
