//! Listing-route resolver with TTL cache and cross-instance identifier
//! mapping. The forward (slug -> route) and reverse (id -> slug)
//! maps are held under a single [`RwLock`] so invalidation can drop both
//! atomically.

use chrono::{DateTime, Utc};
use gateway_types::{GatewayResult, ListingId, Route};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::PersistenceStore;

#[derive(Clone)]
struct CacheEntry {
    route: Route,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Cache {
    by_slug: HashMap<String, CacheEntry>,
    slug_by_id: HashMap<ListingId, String>,
}

/// Cache occupancy snapshot, surfaced on `/ready` and `/status`.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
}

pub struct RouteResolver {
    store: Arc<dyn PersistenceStore>,
    ttl: chrono::Duration,
    cache: RwLock<Cache>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RouteResolver {
    pub fn new(store: Arc<dyn PersistenceStore>, ttl_ms: u64) -> Arc<Self> {
        let resolver = Arc::new(Self {
            store,
            ttl: chrono::Duration::milliseconds(ttl_ms as i64),
            cache: RwLock::new(Cache::default()),
            sweeper: std::sync::Mutex::new(None),
        });
        resolver.spawn_sweeper(ttl_ms);
        resolver
    }

    /// Starts the background evictor, run at `2 x TTL`
    fn spawn_sweeper(self: &Arc<Self>, ttl_ms: u64) {
        let resolver = Arc::clone(self);
        let interval = Duration::from_millis(ttl_ms.saturating_mul(2).max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                resolver.sweep_expired();
            }
        });
        *self.sweeper.lock().unwrap() = Some(handle);
    }

    fn sweep_expired(&self) {
        let now = Utc::now();
        let mut cache = self.cache.write().unwrap();
        let expired: Vec<String> = cache
            .by_slug
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(slug, _)| slug.clone())
            .collect();
        for slug in expired {
            if let Some(entry) = cache.by_slug.remove(&slug) {
                cache.slug_by_id.remove(&entry.route.id);
            }
        }
        debug!(remaining = cache.by_slug.len(), "route cache sweep complete");
    }

    pub async fn resolve_by_slug(&self, slug: &str) -> GatewayResult<Option<Route>> {
        let now = Utc::now();
        if let Some(route) = self.cached_by_slug(slug, now) {
            return Ok(Some(route));
        }

        let route = self.store.lookup_listing_by_slug(slug).await?;
        if let Some(route) = &route {
            if route.state.is_cacheable() {
                self.insert(route.clone(), now);
            }
        }
        Ok(route)
    }

    pub async fn resolve_by_id(&self, id: ListingId) -> GatewayResult<Option<Route>> {
        let now = Utc::now();
        let cached_slug = {
            let cache = self.cache.read().unwrap();
            cache.slug_by_id.get(&id).cloned()
        };
        if let Some(slug) = cached_slug {
            if let Some(route) = self.cached_by_slug(&slug, now) {
                return Ok(Some(route));
            }
        }

        let route = self.store.lookup_listing_by_id(id).await?;
        if let Some(route) = &route {
            if route.state.is_cacheable() {
                self.insert(route.clone(), now);
            }
        }
        Ok(route)
    }

    /// Removes both the forward and reverse entries for `slug` atomically.
    pub fn invalidate(&self, slug: &str) {
        let mut cache = self.cache.write().unwrap();
        if let Some(entry) = cache.by_slug.remove(slug) {
            cache.slug_by_id.remove(&entry.route.id);
        }
    }

    pub fn invalidate_all(&self) {
        let mut cache = self.cache.write().unwrap();
        cache.by_slug.clear();
        cache.slug_by_id.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let cache = self.cache.read().unwrap();
        CacheStats {
            entries: cache.by_slug.len(),
        }
    }

    fn cached_by_slug(&self, slug: &str, now: DateTime<Utc>) -> Option<Route> {
        let cache = self.cache.read().unwrap();
        cache
            .by_slug
            .get(slug)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.route.clone())
    }

    fn insert(&self, route: Route, now: DateTime<Utc>) {
        let mut cache = self.cache.write().unwrap();
        cache.slug_by_id.insert(route.id, route.slug.clone());
        cache.by_slug.insert(
            route.slug.clone(),
            CacheEntry {
                expires_at: now + self.ttl,
                route,
            },
        );
    }
}

impl Drop for RouteResolver {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        warn_if_nonempty(&self.cache);
    }
}

fn warn_if_nonempty(cache: &RwLock<Cache>) {
    let cache = cache.read().unwrap();
    if !cache.by_slug.is_empty() {
        debug!(entries = cache.by_slug.len(), "route resolver dropped with warm cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use gateway_types::RouteState;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn route(slug: &str, state: RouteState) -> Route {
        Route {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            upstream_base_url: "https://upstream.example.com".to_string(),
            capacity_requests_per_minute: 600,
            current_price: dec!(0.005),
            floor_price: dec!(0.0001),
            provider_payout_address: "0xprovider".to_string(),
            state,
            sandbox: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn caches_active_routes_and_serves_reverse_lookup() {
        let store = Arc::new(InMemoryStore::new());
        let r = route("test-api", RouteState::Active);
        store.seed_route(r.clone());

        let resolver = RouteResolver::new(store, 60_000);
        let resolved = resolver.resolve_by_slug("test-api").await.unwrap().unwrap();
        assert_eq!(resolved.id, r.id);

        let by_id = resolver.resolve_by_id(r.id).await.unwrap().unwrap();
        assert_eq!(by_id.slug, "test-api");
        assert_eq!(resolver.stats().entries, 1);
    }

    #[tokio::test]
    async fn suspended_routes_are_served_but_not_cached() {
        let store = Arc::new(InMemoryStore::new());
        let r = route("paused-out", RouteState::Suspended);
        store.seed_route(r.clone());

        let resolver = RouteResolver::new(store, 60_000);
        let resolved = resolver.resolve_by_slug("paused-out").await.unwrap();
        assert!(resolved.is_some());
        assert_eq!(resolver.stats().entries, 0);
    }

    #[tokio::test]
    async fn invalidate_drops_both_maps() {
        let store = Arc::new(InMemoryStore::new());
        let r = route("test-api", RouteState::Active);
        store.seed_route(r.clone());

        let resolver = RouteResolver::new(store, 60_000);
        resolver.resolve_by_slug("test-api").await.unwrap();
        resolver.invalidate("test-api");

        assert_eq!(resolver.stats().entries, 0);
        assert!(resolver.resolve_by_id(r.id).await.unwrap().is_some());
        // reverse index no longer has a cached slug, so this went to the store
        assert_eq!(resolver.stats().entries, 1);
    }
}
