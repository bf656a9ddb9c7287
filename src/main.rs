//! Enriched Cache demo - two cache instances sharing one invalidation relay.
//!
//! Runs the user/order scenario across instances `web-1` and `web-2` on an
//! in-process bus, logs what each instance sees, then keeps both instances
//! alive (usage reports keep being logged) until Ctrl+C.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use enriched_cache::{
    CacheSettings, Config, DistributedEnrichedCache, Expiration, InMemoryBus, TaggedCache, Tags,
};

#[derive(Debug, Clone)]
struct User {
    id: u64,
    name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads .env before the environment
    let config = Config::from_env()?;

    let filter = EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| EnvFilter::new(enriched_cache::config::DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting enriched cache demo...");

    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
    let web1 = DistributedEnrichedCache::connect(
        instance_settings(&config.cache, "web-1"),
        bus.clone(),
    )
    .await;
    let web2 =
        DistributedEnrichedCache::connect(instance_settings(&config.cache, "web-2"), bus).await;

    let user_tags = || Tags::from([("entity", "user"), ("id", "1")]);
    let order_tags = || Tags::from([("entity", "order"), ("id", "1")]);

    // Both instances load the same user, only web-1 caches the order.
    for cache in [&web1, &web2] {
        let user = load_user(cache, 1, user_tags()).await?;
        info!(user_id = user.id, name = %user.name, "User loaded");
    }
    web1.add(
        "order:1",
        "2 items".to_string(),
        Expiration::after(Duration::from_secs(600)),
        order_tags(),
    );

    // Concurrent readers on web-2 are all hits now.
    let reads = futures::future::join_all(
        (0..3).map(|_| load_user(&web2, 1, user_tags())),
    )
    .await;
    info!(hits = reads.len(), "Concurrent reads served");

    info!(index = ?web1.tag_index_snapshot(), "web-1 tag index");

    // Evicting id=1 on web-1 removes both entries there and the user on web-2.
    web1.remove_by_tags(&Tags::from([("id", "1")])).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    for (name, cache) in [("web-1", &web1), ("web-2", &web2)] {
        info!(
            instance = name,
            user_cached = cache.get::<User>("user:1").is_some(),
            order_cached = cache.get::<String>("order:1").is_some(),
            index = ?cache.tag_index_snapshot(),
            "After relayed invalidation"
        );
    }

    info!("Demo running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    web1.shutdown();
    web2.shutdown();

    Ok(())
}

fn instance_settings(base: &CacheSettings, name: &str) -> CacheSettings {
    base.clone().instance_name(name)
}

async fn load_user<C: TaggedCache>(cache: &C, id: u64, tags: Tags) -> anyhow::Result<User> {
    let user = cache
        .get_or_add(
            &format!("user:{}", id),
            || async move {
                Ok::<_, Infallible>(User {
                    id,
                    name: format!("user-{}", id),
                })
            },
            Expiration::sliding(Duration::from_secs(300)),
            tags,
        )
        .await?;
    Ok(user)
}
