use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use serenity::all::GuildId;
use tracing::{debug, info, warn};

pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(5 * 60);

/// Persistence for per-command enable flags. `guild_id = None` is the global scope.
#[async_trait]
pub trait CommandStatusStore: Send + Sync {
    async fn fetch_status(&self, command_name: &str, guild_id: Option<GuildId>) -> Result<Option<bool>>;

    async fn upsert_status(&self, command_name: &str, guild_id: Option<GuildId>, is_enabled: bool) -> Result<()>;

    /// Inserts an enabled row unless one already exists. Never overwrites.
    async fn insert_default_status(&self, command_name: &str, guild_id: Option<GuildId>) -> Result<()>;

    /// Rows for the global scope, plus the guild's own rows when a guild is given,
    /// ordered so that guild rows come after global rows of the same name.
    async fn list_statuses(&self, guild_id: Option<GuildId>) -> Result<Vec<(String, bool)>>;
}

pub fn cache_key(command_name: &str, guild_id: Option<GuildId>) -> String {
    match guild_id {
        Some(guild_id) => format!("{}_{}", command_name, guild_id),
        None => command_name.to_string(),
    }
}

/// Process-local TTL map of command flags.
///
/// Every invalidation bumps an epoch. A value read from the store is only
/// cached when no invalidation happened since the read started.
#[derive(Clone)]
pub struct StatusCache {
    entries: Cache<String, bool>,
    epoch: Arc<AtomicU64>,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().max_capacity(10_000).time_to_live(ttl).build(),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self, key: &str) -> Option<bool> {
        self.entries.get(key).await
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Caches a value read while the cache was at `epoch`. Returns false when
    /// the value was dropped as stale.
    pub async fn insert_if_current(&self, key: String, is_enabled: bool, epoch: u64) -> bool {
        if self.epoch() != epoch {
            return false;
        }
        self.entries.insert(key.clone(), is_enabled).await;

        // an invalidation that raced the insert above must still win
        if self.epoch() != epoch {
            self.entries.invalidate(&key).await;
            return false;
        }
        true
    }

    pub async fn invalidate(&self, key: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.invalidate_all();
    }
}

/// Reads and writes command flags through a [`StatusCache`].
#[derive(Clone)]
pub struct CommandStatusManager {
    store: Arc<dyn CommandStatusStore>,
    cache: StatusCache,
}

impl CommandStatusManager {
    pub fn new(store: Arc<dyn CommandStatusStore>, cache: StatusCache) -> Self {
        Self { store, cache }
    }

    /// Each scope is independent: a guild lookup never falls back to the global
    /// row. Unknown commands are enabled and get a default row. Store errors
    /// fail open.
    pub async fn get_status(&self, command_name: &str, guild_id: Option<GuildId>, use_cache: bool) -> bool {
        let key = cache_key(command_name, guild_id);

        if use_cache {
            if let Some(is_enabled) = self.cache.get(&key).await {
                debug!("[COMMAND STATUS] cache hit for {}", key);
                return is_enabled;
            }
        }

        let epoch = self.cache.epoch();
        let is_enabled = match self.store.fetch_status(command_name, guild_id).await {
            Ok(Some(is_enabled)) => is_enabled,
            Ok(None) => {
                if let Err(e) = self.store.insert_default_status(command_name, guild_id).await {
                    warn!(
                        "[COMMAND STATUS] Failed to insert default row for {}: {}",
                        key, e
                    );
                }
                true
            }
            Err(e) => {
                warn!(
                    "[COMMAND STATUS] Store unavailable while checking {}, treating as enabled: {}",
                    key, e
                );
                return true;
            }
        };

        if !self.cache.insert_if_current(key.clone(), is_enabled, epoch).await {
            debug!("[COMMAND STATUS] {} changed during the read, not caching", key);
        }
        is_enabled
    }

    pub async fn set_status(&self, command_name: &str, is_enabled: bool, guild_id: Option<GuildId>) -> Result<()> {
        self.store
            .upsert_status(command_name, guild_id, is_enabled)
            .await?;

        let key = cache_key(command_name, guild_id);
        self.cache.invalidate(&key).await;

        info!(
            "[COMMAND STATUS] {} is now {}",
            key,
            if is_enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub async fn all_statuses(&self, guild_id: Option<GuildId>) -> Result<BTreeMap<String, bool>> {
        let rows = self.store.list_statuses(guild_id).await?;
        Ok(rows.into_iter().collect())
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("[COMMAND STATUS] cache cleared");
    }

    /// Guard run before a gated handler. Always reads the store.
    pub async fn is_enabled(&self, command_name: &str, guild_id: Option<GuildId>) -> bool {
        self.get_status(command_name, guild_id, false).await
    }
}

pub fn disabled_notice(command_name: &str) -> String {
    format!("❌ The command `/{}` is currently disabled.", command_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MemoryStatusStore {
        rows: Mutex<HashMap<(String, Option<GuildId>), bool>>,
        fetches: AtomicUsize,
        offline: AtomicBool,
        /// Written right after the next fetch, as a concurrent admin would.
        write_after_fetch: Mutex<Option<bool>>,
        /// When set, fetches signal `fetched` and wait for `release` before returning.
        hold_fetch: AtomicBool,
        fetched: Notify,
        release: Notify,
    }

    impl MemoryStatusStore {
        fn row(&self, name: &str, guild_id: Option<GuildId>) -> Option<bool> {
            self.rows.lock().get(&(name.to_string(), guild_id)).copied()
        }

        fn seed(&self, name: &str, guild_id: Option<GuildId>, is_enabled: bool) {
            self.rows.lock().insert((name.to_string(), guild_id), is_enabled);
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CommandStatusStore for MemoryStatusStore {
        async fn fetch_status(&self, command_name: &str, guild_id: Option<GuildId>) -> Result<Option<bool>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                anyhow::bail!("pool timed out");
            }
            let row = self.row(command_name, guild_id);

            if let Some(is_enabled) = self.write_after_fetch.lock().take() {
                self.seed(command_name, guild_id, is_enabled);
            }
            if self.hold_fetch.load(Ordering::SeqCst) {
                self.fetched.notify_one();
                self.release.notified().await;
            }
            Ok(row)
        }

        async fn upsert_status(&self, command_name: &str, guild_id: Option<GuildId>, is_enabled: bool) -> Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                anyhow::bail!("pool timed out");
            }
            self.rows
                .lock()
                .insert((command_name.to_string(), guild_id), is_enabled);
            Ok(())
        }

        async fn insert_default_status(&self, command_name: &str, guild_id: Option<GuildId>) -> Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                anyhow::bail!("pool timed out");
            }
            self.rows
                .lock()
                .entry((command_name.to_string(), guild_id))
                .or_insert(true);
            Ok(())
        }

        async fn list_statuses(&self, guild_id: Option<GuildId>) -> Result<Vec<(String, bool)>> {
            let rows = self.rows.lock();
            let mut global: Vec<_> = rows
                .iter()
                .filter(|((_, g), _)| g.is_none())
                .map(|((name, _), enabled)| (name.clone(), *enabled))
                .collect();
            let mut scoped: Vec<_> = rows
                .iter()
                .filter(|((_, g), _)| guild_id.is_some() && *g == guild_id)
                .map(|((name, _), enabled)| (name.clone(), *enabled))
                .collect();
            global.sort();
            scoped.sort();
            global.extend(scoped);
            Ok(global)
        }
    }

    fn manager_with_ttl(ttl: Duration) -> (Arc<MemoryStatusStore>, CommandStatusManager) {
        let store = Arc::new(MemoryStatusStore::default());
        let manager = CommandStatusManager::new(store.clone(), StatusCache::new(ttl));
        (store, manager)
    }

    fn manager() -> (Arc<MemoryStatusStore>, CommandStatusManager) {
        manager_with_ttl(DEFAULT_STATUS_TTL)
    }

    const GUILD: GuildId = GuildId::new(42);
    const OTHER_GUILD: GuildId = GuildId::new(99);

    #[test]
    fn test_cache_key_scopes() {
        assert_eq!(cache_key("warn", None), "warn");
        assert_eq!(cache_key("warn", Some(GUILD)), "warn_42");
    }

    #[tokio::test]
    async fn test_unknown_command_defaults_to_enabled_and_inserts_row() {
        let (store, manager) = manager();

        assert!(manager.get_status("kick", Some(GUILD), true).await);
        assert_eq!(store.row("kick", Some(GUILD)), Some(true));
        assert_eq!(store.row("kick", None), None);
    }

    #[tokio::test]
    async fn test_default_row_never_overwrites_concurrent_disable() {
        let (store, manager) = manager();
        *store.write_after_fetch.lock() = Some(false);

        // the read saw no row, then an admin disabled the command before the default landed
        assert!(manager.is_enabled("warn", Some(GUILD)).await);

        assert_eq!(store.row("warn", Some(GUILD)), Some(false));
        assert!(!manager.is_enabled("warn", Some(GUILD)).await);
    }

    #[tokio::test]
    async fn test_read_racing_set_status_does_not_cache_old_value() {
        let (store, manager) = manager();
        store.seed("warn", None, true);
        store.hold_fetch.store(true, Ordering::SeqCst);

        let reader = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_status("warn", None, false).await }
        });

        store.fetched.notified().await;
        store.hold_fetch.store(false, Ordering::SeqCst);
        manager.set_status("warn", false, None).await.unwrap();
        store.release.notify_one();

        // the reader answers with what it saw, but must not cache it
        assert!(reader.await.unwrap());
        assert!(!manager.get_status("warn", None, true).await);
        assert_eq!(store.row("warn", None), Some(false));
    }

    #[tokio::test]
    async fn test_insert_skipped_after_clear() {
        let cache = StatusCache::new(DEFAULT_STATUS_TTL);
        let epoch = cache.epoch();

        cache.clear();

        assert!(!cache.insert_if_current("warn".to_string(), true, epoch).await);
        assert_eq!(cache.get("warn").await, None);
        assert!(cache.insert_if_current("warn".to_string(), true, cache.epoch()).await);
        assert_eq!(cache.get("warn").await, Some(true));
    }

    #[tokio::test]
    async fn test_cached_reads_hit_store_once_within_ttl() {
        let (store, manager) = manager();

        assert!(manager.get_status("ban", None, true).await);
        assert!(manager.get_status("ban", None, true).await);

        assert_eq!(store.fetches(), 1);
    }

    #[tokio::test]
    async fn test_uncached_reads_always_hit_store() {
        let (store, manager) = manager();

        manager.get_status("ban", None, false).await;
        manager.get_status("ban", None, false).await;

        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn test_set_status_invalidates_cached_value() {
        let (store, manager) = manager();

        assert!(manager.get_status("warn", Some(GUILD), true).await);
        manager.set_status("warn", false, Some(GUILD)).await.unwrap();

        assert!(!manager.get_status("warn", Some(GUILD), true).await);
        assert!(!manager.get_status("warn", Some(GUILD), false).await);
        assert_eq!(store.fetches(), 3);
    }

    #[tokio::test]
    async fn test_guild_scope_does_not_leak() {
        let (_store, manager) = manager();

        manager.set_status("warn", false, Some(GUILD)).await.unwrap();

        assert!(!manager.is_enabled("warn", Some(GUILD)).await);
        assert!(manager.is_enabled("warn", Some(OTHER_GUILD)).await);
        assert!(manager.is_enabled("warn", None).await);
    }

    #[tokio::test]
    async fn test_guild_lookup_ignores_global_row() {
        let (_store, manager) = manager();

        manager.set_status("clear", false, None).await.unwrap();

        assert!(!manager.is_enabled("clear", None).await);
        assert!(manager.is_enabled("clear", Some(GUILD)).await);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let (store, manager) = manager();
        manager.set_status("mute", false, Some(GUILD)).await.unwrap();

        store.offline.store(true, Ordering::SeqCst);

        assert!(manager.is_enabled("mute", Some(GUILD)).await);
        assert!(manager.set_status("mute", true, Some(GUILD)).await.is_err());

        // the fail-open answer is not cached
        store.offline.store(false, Ordering::SeqCst);
        assert!(!manager.get_status("mute", Some(GUILD), true).await);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_reload() {
        let (store, manager) = manager();

        manager.get_status("role", None, true).await;
        manager.clear_cache();
        manager.get_status("role", None, true).await;

        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let (store, manager) = manager_with_ttl(Duration::from_millis(50));

        manager.get_status("voice", None, true).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.get_status("voice", None, true).await;

        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn test_all_statuses_prefers_guild_rows() {
        let (_store, manager) = manager();

        manager.set_status("warn", true, None).await.unwrap();
        manager.set_status("kick", false, None).await.unwrap();
        manager.set_status("warn", false, Some(GUILD)).await.unwrap();
        manager.set_status("ban", false, Some(OTHER_GUILD)).await.unwrap();

        let statuses = manager.all_statuses(Some(GUILD)).await.unwrap();
        assert_eq!(statuses.get("warn"), Some(&false));
        assert_eq!(statuses.get("kick"), Some(&false));
        assert_eq!(statuses.get("ban"), None);

        let global = manager.all_statuses(None).await.unwrap();
        assert_eq!(global.get("warn"), Some(&true));
        assert_eq!(global.len(), 2);
    }

    #[test]
    fn test_disabled_notice_names_command() {
        assert!(disabled_notice("warn").contains("`/warn`"));
    }
}
