use std::sync::Arc;

use dashmap::DashSet;

use crate::error::AppResult;
use crate::models::UserId;

/// In-memory mirror of the `banlist` table. The control surface mutates this
/// directly (add/remove); the Event Router only ever reads it.
#[derive(Default)]
pub struct BanSet {
    banned: DashSet<UserId>,
}

impl BanSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn load_from_storage(pool: &sqlx::PgPool) -> AppResult<Arc<Self>> {
        let set = Self::new();
        for user_id in crate::db::banlist::list_all(pool).await? {
            set.banned.insert(user_id);
        }
        Ok(set)
    }

    pub fn add(&self, user_id: UserId) {
        self.banned.insert(user_id);
    }

    pub fn remove(&self, user_id: UserId) {
        self.banned.remove(&user_id);
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.banned.contains(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_contains() {
        let bans = BanSet::new();
        assert!(!bans.contains(42));
        bans.add(42);
        assert!(bans.contains(42));
        bans.remove(42);
        assert!(!bans.contains(42));
    }
}
