//! Integration tests using [testcontainers-rs](https://github.com/testcontainers/testcontainers-rs):
//! all three repositories over a real Redis Stack (RedisBloom commands included).
//!
//! Requires Docker and the `testcontainers` feature. Run with:
//! `cargo test --features testcontainers --test integration_testcontainers`

#[cfg(feature = "testcontainers")]
mod redis_stack {
    use redup::{
        BloomFilterRepository, BloomOptions, CuckooFilterRepository, CuckooOptions, Deduplicator,
        ExpiringKeyRepository, KeyRepository, KeyStore, RedisStore,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use testcontainers::core::{IntoContainerPort, WaitFor};
    use testcontainers::runners::AsyncRunner;
    use testcontainers::{ContainerAsync, GenericImage};

    async fn start() -> (ContainerAsync<GenericImage>, String) {
        let image = GenericImage::new("redis/redis-stack-server", "7.2.0-v10")
            .with_exposed_port(6379.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
        let container = image.start().await.expect("start redis-stack container");
        let host = container.get_host().await.expect("get redis host");
        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("get redis port");
        (container, format!("redis://{host}:{port}/"))
    }

    #[tokio::test]
    async fn expiring_key_scenario_and_expiry() {
        let (_container, url) = start().await;
        let store = Arc::new(RedisStore::connect(&url).await.unwrap());
        let repo = Arc::new(
            ExpiringKeyRepository::new(store.clone(), Duration::from_millis(500))
                .unwrap()
                .with_key_prefix("tc:"),
        );
        let dedup = Deduplicator::builder()
            .repository(repo.clone())
            .build()
            .await
            .unwrap();

        assert!(!dedup.is_duplicate("Nairobi").await.unwrap());
        assert!(dedup.is_duplicate("Nairobi").await.unwrap());
        assert_eq!(repo.len().await.unwrap(), 1);

        let key = dedup.fingerprint("Nairobi").unwrap();
        let mut prefixed = b"tc:".to_vec();
        prefixed.extend_from_slice(key.as_bytes());
        let ttl = store.time_to_live(&prefixed).await.unwrap().unwrap();
        assert!(ttl <= Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!dedup.is_duplicate("Nairobi").await.unwrap());
    }

    #[tokio::test]
    async fn expiring_key_atomic_insert() {
        let (_container, url) = start().await;
        let store = Arc::new(RedisStore::connect(&url).await.unwrap());
        let repo = ExpiringKeyRepository::new(store, Duration::from_secs(60))
            .unwrap()
            .with_atomic_insert(true);
        let dedup = Arc::new(
            Deduplicator::builder()
                .repository(Arc::new(repo))
                .build()
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let d = dedup.clone();
            handles.push(tokio::spawn(async move { d.is_duplicate("race").await.unwrap() }));
        }
        let mut unseen = 0;
        for h in handles {
            if !h.await.unwrap() {
                unseen += 1;
            }
        }
        assert_eq!(unseen, 1);
    }

    #[tokio::test]
    async fn bloom_scenario_and_reuse() {
        let (_container, url) = start().await;
        let store = Arc::new(RedisStore::connect(&url).await.unwrap());
        let opts = BloomOptions::new("example_bf", 0.001, 4);
        let repo = BloomFilterRepository::new(store.clone(), opts.clone())
            .await
            .unwrap();
        let dedup = Deduplicator::builder()
            .repository(Arc::new(repo))
            .build()
            .await
            .unwrap();

        let cities = ["Nairobi", "Mombasa", "Kisumu", "Nakuru"];
        for c in cities {
            assert!(!dedup.is_duplicate(c).await.unwrap(), "{c}");
        }
        for c in cities {
            assert!(dedup.is_duplicate(c).await.unwrap(), "{c}");
        }
        assert_eq!(dedup.forget("Nairobi").await.unwrap_err().kind(), "unsupported");

        // A second reservation under the same key keeps the existing members.
        let again = BloomFilterRepository::new(store, opts).await.unwrap();
        let key = dedup.fingerprint("Kisumu").unwrap();
        let payload = redup::Payload::new(key, Vec::new());
        assert!(again.is_duplicate(&payload).await.unwrap());
    }

    #[tokio::test]
    async fn cuckoo_delete_and_reinsert() {
        let (_container, url) = start().await;
        let store = Arc::new(RedisStore::connect(&url).await.unwrap());
        let repo = CuckooFilterRepository::new(
            store,
            CuckooOptions::new("example_cf", 1024, Duration::from_secs(15)).with_bucket_size(4),
        )
        .await
        .unwrap();
        let dedup = Deduplicator::builder()
            .repository(Arc::new(repo))
            .build()
            .await
            .unwrap();

        assert!(!dedup.is_duplicate("Nairobi").await.unwrap());
        assert!(dedup.is_duplicate("Nairobi").await.unwrap());
        assert!(dedup.forget("Nairobi").await.unwrap());
        assert!(!dedup.is_duplicate("Nairobi").await.unwrap());
        assert!(dedup.is_duplicate("Nairobi").await.unwrap());
        assert_eq!(dedup.window(), Some(Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn from_config_over_redis() {
        let (_container, url) = start().await;
        let yaml = format!(
            "store:\n  backend: redis\n  url: \"{url}\"\nfingerprint:\n  algorithm: sha256\ntimeout_ms: 2000\nstrategy:\n  type: bloom\n  filter_key: cfg_bf\n  capacity: 100\n"
        );
        let config = redup::Config::from_yaml(&yaml).unwrap();
        let dedup = Deduplicator::from_config(&config).await.unwrap();
        assert_eq!(dedup.strategy(), "bloom");
        assert_eq!(dedup.fingerprint("x").unwrap().len(), 32);
        assert!(!dedup.is_duplicate(&serde_json::json!({"a": 1, "b": 2})).await.unwrap());
        assert!(dedup.is_duplicate(&serde_json::json!({"b": 2, "a": 1})).await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_store_is_an_error() {
        let err = RedisStore::connect("redis://127.0.0.1:1/").await.err();
        assert!(err.is_some());
    }
}
