//! Registry of live tunnels, keyed by subdomain.
//!
//! Critical sections are lookup/insert only; tunnel close work happens
//! outside the registry lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::tunnel::Tunnel;

/// Concurrent map from subdomain to its single live tunnel.
#[derive(Default)]
pub struct Registry {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert only if the subdomain is free. Returns whether inserted.
    pub async fn register(&self, subdomain: &str, tunnel: Arc<Tunnel>) -> bool {
        let mut tunnels = self.tunnels.write().await;
        if tunnels.contains_key(subdomain) {
            return false;
        }
        tunnels.insert(subdomain.to_string(), tunnel);
        debug!(subdomain, "tunnel registered");
        true
    }

    /// Remove only if the registered tunnel is this exact instance, so a
    /// reconnecting client cannot evict its own replacement.
    pub async fn unregister(&self, subdomain: &str, tunnel: &Arc<Tunnel>) {
        let mut tunnels = self.tunnels.write().await;
        if let Some(current) = tunnels.get(subdomain) {
            if Arc::ptr_eq(current, tunnel) {
                tunnels.remove(subdomain);
                debug!(subdomain, "tunnel unregistered");
            }
        }
    }

    pub async fn get(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.read().await.get(subdomain).cloned()
    }

    pub async fn has(&self, subdomain: &str) -> bool {
        self.tunnels.read().await.contains_key(subdomain)
    }

    /// All registered subdomains, sorted for stable enumeration.
    pub async fn list(&self) -> Vec<String> {
        let mut subdomains: Vec<String> = self.tunnels.read().await.keys().cloned().collect();
        subdomains.sort();
        subdomains
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    /// Close every registered tunnel. Used on server shutdown.
    pub async fn close_all(&self) {
        let tunnels: Vec<Arc<Tunnel>> = self.tunnels.read().await.values().cloned().collect();
        for tunnel in tunnels {
            tunnel.close(Some("server shutdown")).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::Tunnel;

    fn tunnel(subdomain: &str) -> Arc<Tunnel> {
        let (_near, far) = tokio::io::duplex(64);
        let (_read, write) = tokio::io::split(far);
        Arc::new(Tunnel::new(subdomain, "key", Box::new(write)))
    }

    #[tokio::test]
    async fn register_is_insert_if_absent() {
        let registry = Registry::new();
        let first = tunnel("foo");

        assert!(registry.register("foo", first.clone()).await);
        assert!(!registry.register("foo", tunnel("foo")).await);
        assert!(registry.has("foo").await);
        assert!(!registry.has("bar").await);

        let got = registry.get("foo").await.unwrap();
        assert!(Arc::ptr_eq(&got, &first));
        assert!(registry.get("bar").await.is_none());
    }

    #[tokio::test]
    async fn unregister_requires_same_instance() {
        let registry = Registry::new();
        let original = tunnel("foo");
        let imposter = tunnel("foo");

        registry.register("foo", original.clone()).await;
        registry.unregister("foo", &imposter).await;
        assert!(registry.has("foo").await);

        registry.unregister("foo", &original).await;
        assert!(!registry.has("foo").await);
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let registry = Registry::new();
        registry.register("zebra", tunnel("zebra")).await;
        registry.register("alpha", tunnel("alpha")).await;
        registry.register("mid", tunnel("mid")).await;

        assert_eq!(registry.list().await, vec!["alpha", "mid", "zebra"]);
        assert_eq!(registry.len().await, 3);
    }
}
