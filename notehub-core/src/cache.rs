//! In-process token-validation cache
//!
//! AuthService is the source of truth for sessions; this cache bounds how
//! often the hot paths (proxy, relay upgrades) round-trip to it. Positive
//! entries live 60 s, negative entries 5 s — the stale-auth window is
//! therefore at most one minute.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::clients::AuthClient;
use crate::error::Result;
use crate::model::User;

const POSITIVE_TTL: Duration = Duration::from_secs(60);
const NEGATIVE_TTL: Duration = Duration::from_secs(5);

struct CacheEntry {
    user: Option<User>,
    expires_at: Instant,
}

/// Concurrent token → user cache. Writes are idempotent; a racing double
/// validation just stores the same entry twice.
#[derive(Default)]
pub struct TokenCache {
    entries: DashMap<String, CacheEntry>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached lookup. `None` = miss, `Some(None)` = cached-invalid.
    pub fn get(&self, token: &str) -> Option<Option<User>> {
        let entry = self.entries.get(token)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(token);
            return None;
        }
        Some(entry.user.clone())
    }

    pub fn insert(&self, token: &str, user: Option<User>) {
        let ttl = if user.is_some() { POSITIVE_TTL } else { NEGATIVE_TTL };
        self.entries.insert(
            token.to_string(),
            CacheEntry {
                user,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop a token eagerly (logout).
    pub fn invalidate(&self, token: &str) {
        self.entries.remove(token);
    }

    /// Validate through the cache. Transient AuthService failures propagate
    /// without being cached, so a flapping auth service does not lock users
    /// out for a TTL.
    pub async fn validate(&self, auth: &AuthClient, token: &str) -> Result<Option<User>> {
        if let Some(cached) = self.get(token) {
            return Ok(cached);
        }
        let user = auth.validate(token).await?;
        self.insert(token, user.clone());
        Ok(user)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "a@b.c".to_string(),
            username: "a".to_string(),
            name: "A".to_string(),
            avatar: None,
            plan: Default::default(),
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = TokenCache::new();
        assert!(cache.get("tok").is_none());

        cache.insert("tok", Some(test_user()));
        let hit = cache.get("tok").expect("hit");
        assert!(hit.is_some());
    }

    #[test]
    fn negative_entries_are_cached() {
        let cache = TokenCache::new();
        cache.insert("bad", None);
        let hit = cache.get("bad").expect("negative entry cached");
        assert!(hit.is_none());
    }

    #[test]
    fn invalidate_removes() {
        let cache = TokenCache::new();
        cache.insert("tok", Some(test_user()));
        cache.invalidate("tok");
        assert!(cache.get("tok").is_none());
    }
}
