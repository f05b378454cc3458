//! Distributed map registry
//!
//! The cache cluster is an external collaborator behind the `Cluster` and
//! `DMap` traits. The registry lazily creates one map per qualified table
//! (`"{dbname}.{schema}.{table}"`) and reuses existing handles. Creation is
//! double-checked: a read probe first, then a write lock with a re-probe so
//! racing writers produce exactly one external create call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use pgscale_common::config::DMapParams;
use pgscale_common::error::{PgScaleError, Result};

/// A distributed TTL'd map from string key to byte blob.
#[async_trait]
pub trait DMap: Send + Sync {
    /// Fetch a value. Absent keys are `PgScaleError::KeyNotFound`.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Store a value under the map's TTL/eviction parameters.
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;
}

impl std::fmt::Debug for dyn DMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn DMap>")
    }
}

/// The cluster-side factory for distributed maps.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn create_dmap(&self, name: &str, params: &DMapParams) -> Result<Arc<dyn DMap>>;
}

/// Name -> handle registry for all DMap instances of this node.
pub struct DMapRegistry {
    cluster: Arc<dyn Cluster>,
    plan: HashMap<String, DMapParams>,
    maps: RwLock<HashMap<String, Arc<dyn DMap>>>,
}

impl DMapRegistry {
    pub fn new(cluster: Arc<dyn Cluster>, plan: HashMap<String, DMapParams>) -> Self {
        Self {
            cluster,
            plan,
            maps: RwLock::new(HashMap::new()),
        }
    }

    /// Return the map with the given name, creating it on the cluster on
    /// first use.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<dyn DMap>> {
        {
            let maps = self.maps.read().await;
            if let Some(dm) = maps.get(name) {
                return Ok(dm.clone());
            }
        }

        let mut maps = self.maps.write().await;
        // Another writer may have created it while we waited for the lock.
        if let Some(dm) = maps.get(name) {
            return Ok(dm.clone());
        }

        let params = self
            .plan
            .get(name)
            .ok_or_else(|| PgScaleError::Cache(format!("no dmap parameters for {name}")))?;

        let dm = self.cluster.create_dmap(name, params).await?;
        maps.insert(name.to_string(), dm.clone());
        Ok(dm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullDMap;

    #[async_trait]
    impl DMap for NullDMap {
        async fn get(&self, _key: &str) -> Result<Bytes> {
            Err(PgScaleError::KeyNotFound)
        }

        async fn put(&self, _key: &str, _value: Bytes) -> Result<()> {
            Ok(())
        }
    }

    struct CountingCluster {
        creates: AtomicUsize,
    }

    #[async_trait]
    impl Cluster for CountingCluster {
        async fn create_dmap(&self, _name: &str, _params: &DMapParams) -> Result<Arc<dyn DMap>> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            // Let racing callers pile up behind the write lock.
            tokio::task::yield_now().await;
            Ok(Arc::new(NullDMap))
        }
    }

    fn registry_with_plan(name: &str) -> (Arc<DMapRegistry>, Arc<CountingCluster>) {
        let cluster = Arc::new(CountingCluster {
            creates: AtomicUsize::new(0),
        });
        let mut plan = HashMap::new();
        plan.insert(name.to_string(), DMapParams::default());
        (
            Arc::new(DMapRegistry::new(cluster.clone(), plan)),
            cluster,
        )
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_is_idempotent() {
        let (registry, cluster) = registry_with_plan("appdb.public.users");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create("appdb.public.users").await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(cluster.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unplanned_name_is_cache_error() {
        let (registry, cluster) = registry_with_plan("appdb.public.users");
        let err = registry.get_or_create("appdb.public.ghost").await.unwrap_err();
        assert!(matches!(err, PgScaleError::Cache(_)));
        assert_eq!(cluster.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handle_is_reused() {
        let (registry, cluster) = registry_with_plan("appdb.public.users");
        let a = registry.get_or_create("appdb.public.users").await.unwrap();
        let b = registry.get_or_create("appdb.public.users").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cluster.creates.load(Ordering::SeqCst), 1);
    }
}
