use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::db;
use crate::models::{DictionaryEntry, DictionaryScope, GuildId, UserId};

/// A point-in-time read of the three scopes relevant to one normalize call.
pub struct DictionarySnapshot {
    pub global: Vec<DictionaryEntry>,
    pub guild: Vec<DictionaryEntry>,
    pub user: Vec<DictionaryEntry>,
}

struct Inner {
    global: Vec<DictionaryEntry>,
    guild: HashMap<GuildId, Vec<DictionaryEntry>>,
    user: HashMap<UserId, Vec<DictionaryEntry>>,
}

/// Three-tier substitution cache. All mutation and all snapshotting goes
/// through one exclusive lock — the contract explicitly forbids three
/// independently-locked maps, since `invalidate` and `snapshotForContext`
/// must observe each other atomically.
pub struct DictionaryCache {
    pool: PgPool,
    inner: Mutex<Inner>,
}

impl DictionaryCache {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            inner: Mutex::new(Inner {
                global: Vec::new(),
                guild: HashMap::new(),
                user: HashMap::new(),
            }),
        })
    }

    /// Populate `global` from storage. Call once at startup, then again on
    /// every tick of `refresh_loop`.
    pub async fn refresh_global(&self) {
        match db::dictionary::list_global(&self.pool).await {
            Ok(entries) => {
                self.inner.lock().await.global = entries;
            }
            Err(err) => {
                tracing::warn!(error = %err, "dictionary global refresh failed, serving stale cache");
            }
        }
    }

    /// Runs forever on a fixed interval; intended to be spawned once.
    pub async fn refresh_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.refresh_global().await;
        }
    }

    async fn guild_entries(&self, guild_id: GuildId) -> Vec<DictionaryEntry> {
        {
            let inner = self.inner.lock().await;
            if let Some(entries) = inner.guild.get(&guild_id) {
                return entries.clone();
            }
        }
        let entries = db::dictionary::list_for_guild(&self.pool, guild_id)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, guild_id, "guild dictionary load failed");
                Vec::new()
            });
        self.inner.lock().await.guild.insert(guild_id, entries.clone());
        entries
    }

    async fn user_entries(&self, user_id: UserId) -> Vec<DictionaryEntry> {
        {
            let inner = self.inner.lock().await;
            if let Some(entries) = inner.user.get(&user_id) {
                return entries.clone();
            }
        }
        let entries = db::dictionary::list_for_user(&self.pool, user_id)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, user_id, "user dictionary load failed");
                Vec::new()
            });
        self.inner.lock().await.user.insert(user_id, entries.clone());
        entries
    }

    pub async fn snapshot_for_context(
        &self,
        guild_id: Option<GuildId>,
        user_id: Option<UserId>,
    ) -> DictionarySnapshot {
        let global = self.inner.lock().await.global.clone();
        let guild = match guild_id {
            Some(id) => self.guild_entries(id).await,
            None => Vec::new(),
        };
        let user = match user_id {
            Some(id) => self.user_entries(id).await,
            None => Vec::new(),
        };
        DictionarySnapshot { global, guild, user }
    }

    /// Drop a cached scope entry so the next lookup re-reads storage.
    pub async fn invalidate(&self, scope: DictionaryScope, key: GuildOrUserId) {
        let mut inner = self.inner.lock().await;
        match (scope, key) {
            (DictionaryScope::Guild, GuildOrUserId::Guild(id)) => {
                inner.guild.remove(&id);
            }
            (DictionaryScope::User, GuildOrUserId::User(id)) => {
                inner.user.remove(&id);
            }
            (DictionaryScope::Global, _) => {
                drop(inner);
                self.refresh_global().await;
            }
            _ => {}
        }
    }
}

/// Disambiguates which id an `invalidate` call carries, since guild and user
/// ids share the same underlying integer type.
#[derive(Debug, Clone, Copy)]
pub enum GuildOrUserId {
    Guild(GuildId),
    User(UserId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str) -> DictionaryEntry {
        DictionaryEntry {
            key: key.into(),
            value: value.into(),
            author_id: None,
        }
    }

    fn lazy_pool() -> PgPool {
        sqlx::pool::PoolOptions::<sqlx::Postgres>::new()
            .max_connections(1)
            .connect_lazy("postgres://invalid/invalid")
            .unwrap()
    }

    #[tokio::test]
    async fn snapshot_serves_cached_guild_entries_without_reloading() {
        let cache = DictionaryCache::new(lazy_pool());
        cache.inner.lock().await.guild.insert(7, vec![entry("cat", "ねこ")]);

        let snapshot = cache.snapshot_for_context(Some(7), None).await;
        assert_eq!(snapshot.guild.len(), 1);
        assert_eq!(snapshot.guild[0].value, "ねこ");
    }

    #[tokio::test]
    async fn invalidate_drops_cached_guild_scope() {
        let cache = DictionaryCache::new(lazy_pool());
        cache.inner.lock().await.guild.insert(7, vec![entry("cat", "ねこ")]);

        cache.invalidate(DictionaryScope::Guild, GuildOrUserId::Guild(7)).await;

        assert!(cache.inner.lock().await.guild.get(&7).is_none());
    }
}
