mod common;

use common::MemoryMetadataStore;
use ferry_core::MIB;
use ferry_core::config::LimitsConfig;
use ferry_upload::{RequestContext, SizeLimitResolver, UploadError};
use proptest::prelude::*;
use std::sync::Arc;

const GLOBAL_MAX: u64 = 1024 * MIB;

fn resolver(store: &Arc<MemoryMetadataStore>) -> SizeLimitResolver {
    SizeLimitResolver::new(
        store.clone(),
        &LimitsConfig {
            max_file_size_bytes: GLOBAL_MAX,
        },
    )
}

#[tokio::test]
async fn test_unset_bucket_limit_uses_tenant_limit() {
    let store = Arc::new(
        MemoryMetadataStore::new()
            .with_tenant("acme", Some(100 * MIB))
            .with_bucket("photos", None),
    );
    let ctx = RequestContext::new("acme");

    let limit = resolver(&store)
        .resolve(&ctx, "acme", Some("photos"))
        .await
        .unwrap();
    assert_eq!(limit, 100 * MIB);
}

#[tokio::test]
async fn test_bucket_limit_tightens_tenant_limit() {
    let store = Arc::new(
        MemoryMetadataStore::new()
            .with_tenant("acme", Some(100 * MIB))
            .with_bucket("photos", Some((50 * MIB) as i64)),
    );
    let ctx = RequestContext::new("acme");

    let limit = resolver(&store)
        .resolve(&ctx, "acme", Some("photos"))
        .await
        .unwrap();
    assert_eq!(limit, 50 * MIB);
}

#[tokio::test]
async fn test_bucket_limit_cannot_exceed_tenant_limit() {
    let store = Arc::new(
        MemoryMetadataStore::new()
            .with_tenant("acme", Some(50 * MIB))
            .with_bucket("photos", Some((100 * MIB) as i64)),
    );
    let ctx = RequestContext::new("acme");

    let limit = resolver(&store)
        .resolve(&ctx, "acme", Some("photos"))
        .await
        .unwrap();
    assert_eq!(limit, 50 * MIB);
}

#[tokio::test]
async fn test_tenant_without_limit_gets_global_maximum() {
    let store = Arc::new(
        MemoryMetadataStore::new()
            .with_tenant("free", None)
            .with_tenant("huge", Some(10 * GLOBAL_MAX)),
    );
    let ctx = RequestContext::new("free");
    let resolver = resolver(&store);

    assert_eq!(resolver.resolve(&ctx, "free", None).await.unwrap(), GLOBAL_MAX);
    assert_eq!(resolver.resolve(&ctx, "huge", None).await.unwrap(), GLOBAL_MAX);
}

#[tokio::test]
async fn test_pre_creation_check_skips_bucket_lookup() {
    let store = Arc::new(MemoryMetadataStore::new().with_tenant("acme", Some(7)));
    let ctx = RequestContext::new("acme");

    assert_eq!(resolver(&store).resolve(&ctx, "acme", None).await.unwrap(), 7);
    assert_eq!(store.bucket_lookups(), 0);
}

#[tokio::test]
async fn test_bucket_fetched_once_per_request() {
    let store = Arc::new(
        MemoryMetadataStore::new()
            .with_tenant("acme", Some(100))
            .with_bucket("photos", Some(10)),
    );
    let resolver = resolver(&store);

    let ctx = RequestContext::new("acme");
    for _ in 0..3 {
        resolver.resolve(&ctx, "acme", Some("photos")).await.unwrap();
    }
    let row = resolver.bucket(&ctx, "photos").await.unwrap();
    assert_eq!(row.file_size_limit, Some(10));
    assert_eq!(store.bucket_lookups(), 1);
    assert_eq!(store.tenant_lookups(), 1);

    // A new request starts with an empty cache.
    let ctx = RequestContext::new("acme");
    resolver.resolve(&ctx, "acme", Some("photos")).await.unwrap();
    assert_eq!(store.bucket_lookups(), 2);
}

#[tokio::test]
async fn test_missing_bucket_is_not_found() {
    let store = Arc::new(MemoryMetadataStore::new().with_tenant("acme", Some(100)));
    let ctx = RequestContext::new("acme");

    match resolver(&store).resolve(&ctx, "acme", Some("nope")).await {
        Err(UploadError::BucketNotFound(bucket)) => assert_eq!(bucket, "nope"),
        other => panic!("expected bucket not found, got {other:?}"),
    }
}

#[tokio::test]
async fn test_tenant_lookup_failure_is_surfaced_not_defaulted() {
    let store = Arc::new(
        MemoryMetadataStore::new()
            .with_tenant("acme", Some(100))
            .with_bucket("photos", None),
    );
    store.fail_tenant_lookups(true);
    let resolver = resolver(&store);

    let ctx = RequestContext::new("acme");
    match resolver.resolve(&ctx, "acme", Some("photos")).await {
        Err(err @ UploadError::QuotaLookupFailed(_)) => assert!(err.is_retryable()),
        other => panic!("expected quota lookup failure, got {other:?}"),
    }

    // Failures are not memoized; the same request retries the lookup.
    store.fail_tenant_lookups(false);
    assert_eq!(
        resolver.resolve(&ctx, "acme", Some("photos")).await.unwrap(),
        100
    );
}

#[tokio::test]
async fn test_unknown_tenant() {
    let store = Arc::new(MemoryMetadataStore::new());
    let ctx = RequestContext::new("ghost");

    assert!(matches!(
        resolver(&store).resolve(&ctx, "ghost", None).await,
        Err(UploadError::TenantNotFound(_))
    ));
}

proptest! {
    #[test]
    fn prop_resolved_limit_is_min_of_bucket_and_tenant(
        tenant_limit in 0..=GLOBAL_MAX,
        bucket_limit in proptest::option::of(0..=(2 * GLOBAL_MAX as i64)),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let store = Arc::new(
            MemoryMetadataStore::new()
                .with_tenant("t", Some(tenant_limit))
                .with_bucket("b", bucket_limit),
        );
        let ctx = RequestContext::new("t");

        let limit = runtime
            .block_on(resolver(&store).resolve(&ctx, "t", Some("b")))
            .unwrap();

        let expected = match bucket_limit {
            Some(bucket) => (bucket as u64).min(tenant_limit),
            None => tenant_limit,
        };
        prop_assert_eq!(limit, expected);
        prop_assert!(limit <= tenant_limit);
    }
}
