//! Shared helpers for store-pool integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use vela_base::gossip::Gossip;
use vela_base::hlc::Clock;
use vela_base::stopper::Stopper;
use vela_store::descriptor::{
    store_gossip_key, Attributes, NodeDescriptor, StoreCapacity, StoreDescriptor, StoreId,
};
use vela_store::store_pool::{StorePool, StorePoolConfig};

/// Upper bound for condition polling; individual waits are far shorter.
pub const WAIT_DEADLINE: Duration = Duration::from_secs(5);

pub struct TestCluster {
    pub gossip: Arc<Gossip>,
    pub stopper: Stopper,
    pub pool: StorePool,
}

/// Build a gossip hub, clock, stopper, and pool wired together.
pub fn setup(config: StorePoolConfig) -> TestCluster {
    init_tracing();
    let gossip = Arc::new(Gossip::new());
    let clock = Arc::new(Clock::new());
    let stopper = Stopper::new();
    let pool = StorePool::new(&gossip, clock, config, &stopper);
    TestCluster {
        gossip,
        stopper,
        pool,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn descriptor(store_id: StoreId, attrs: &[&str]) -> StoreDescriptor {
    StoreDescriptor {
        store_id,
        node: NodeDescriptor {
            node_id: store_id,
            address: format!("10.0.0.{store_id}:26257"),
            attrs: Attributes::default(),
        },
        attrs: Attributes::from(attrs),
        capacity: StoreCapacity {
            capacity: 100,
            available: 50,
            range_count: store_id,
        },
    }
}

/// Publish a descriptor for `store_id`; the pool's callback runs before this
/// returns.
pub fn gossip_store(cluster: &TestCluster, store_id: StoreId, attrs: &[&str]) {
    let desc = descriptor(store_id, attrs);
    cluster
        .gossip
        .add_info(&store_gossip_key(store_id), desc.encode().unwrap());
}

/// Poll `cond` until it holds or `deadline` passes; returns the final value.
pub async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    cond()
}
