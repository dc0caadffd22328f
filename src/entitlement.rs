//! Daily generation quota and the per-client records it is decided on.
//!
//! The decision functions are pure: they take the quota day explicitly in
//! their `_on` forms, and the plain forms use the local calendar date of the
//! running process. A day boundary crossed mid-session is only noticed by the
//! next call.

use std::sync::Arc;

use chrono::Local;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    data::Kv,
    types::{GeneratedImage, User},
};

pub const FREE_DAILY_GENERATIONS: u32 = 3;

pub const USER_KEY: &str = "ai-generator-user";
pub const IMAGES_KEY: &str = "ai-generator-images";

/// Current quota day, `YYYY-MM-DD` in local time.
pub fn today() -> String {
    Local::now().date_naive().format("%Y-%m-%d").to_string()
}

pub fn can_generate_today(user: &User) -> bool {
    can_generate_on(user, &today())
}

pub fn can_generate_on(user: &User, today: &str) -> bool {
    if user.last_generation_date != today {
        return true;
    }
    user.is_premium || user.daily_generations < FREE_DAILY_GENERATIONS
}

/// Returns the user with one more generation counted. A stale counter is
/// reset to 1 rather than incremented. Does not enforce the cap.
#[must_use]
pub fn increment_daily_generations(user: &User) -> User {
    increment_daily_generations_on(user, &today())
}

#[must_use]
pub fn increment_daily_generations_on(user: &User, today: &str) -> User {
    if user.last_generation_date != today {
        return User {
            daily_generations: 1,
            last_generation_date: today.to_string(),
            ..user.clone()
        };
    }
    User {
        daily_generations: user.daily_generations.saturating_add(1),
        ..user.clone()
    }
}

/// `None` means unlimited.
pub fn remaining_on(user: &User, today: &str) -> Option<u32> {
    if user.is_premium {
        return None;
    }
    let used = if user.last_generation_date == today {
        user.daily_generations
    } else {
        0
    };
    Some(FREE_DAILY_GENERATIONS.saturating_sub(used))
}

pub fn remaining_today(user: &User) -> Option<u32> {
    remaining_on(user, &today())
}

#[must_use]
pub fn upgrade(user: &User) -> User {
    User {
        is_premium: true,
        ..user.clone()
    }
}

/// The user and image records of one client.
///
/// Nothing here returns an error: an unreachable store reads as empty and
/// swallows writes, and malformed stored JSON reads as absent. Both are
/// logged.
#[derive(Clone)]
pub struct Entitlements {
    kv: Arc<dyn Kv>,
    scope: String,
}

impl Entitlements {
    pub fn new(kv: Arc<dyn Kv>, scope: &str) -> Self {
        Self {
            kv,
            scope: scope.to_string(),
        }
    }

    pub async fn user(&self) -> Option<User> {
        self.read(USER_KEY).await
    }

    pub async fn set_user(&self, user: &User) {
        self.write(USER_KEY, user).await;
    }

    /// Newest first.
    pub async fn images(&self) -> Vec<GeneratedImage> {
        self.read(IMAGES_KEY).await.unwrap_or_default()
    }

    pub async fn add_image(&self, image: GeneratedImage) {
        let mut images = self.images().await;
        images.insert(0, image);
        self.write(IMAGES_KEY, &images).await;
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.kv.get(&self.scope, key).await {
            Ok(raw_opt) => raw_opt?,
            Err(error) => {
                tracing::warn!(?error, scope = %self.scope, key, "Storage read failed.");
                return None;
            }
        };
        serde_json::from_str(&raw)
            .inspect_err(|error| {
                tracing::warn!(
                    ?error,
                    scope = %self.scope,
                    key,
                    "Ignoring malformed stored value."
                );
            })
            .ok()
    }

    async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(?error, key, "Failed to serialize value.");
                return;
            }
        };
        if let Err(error) = self.kv.set(&self.scope, key, &raw).await {
            tracing::warn!(?error, scope = %self.scope, key, "Storage write failed.");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use super::*;
    use crate::data::Memory;

    const TODAY: &str = "2026-10-17";
    const YESTERDAY: &str = "2026-10-16";

    fn user(is_premium: bool, daily_generations: u32, date: &str) -> User {
        User {
            id: "u1".to_string(),
            email: "u1@example.com".to_string(),
            is_premium,
            daily_generations,
            last_generation_date: date.to_string(),
        }
    }

    fn image(id: &str) -> GeneratedImage {
        GeneratedImage {
            id: id.to_string(),
            prompt: format!("prompt {id}"),
            image_url: format!("https://img.example.com/{id}.png"),
            created_at: "2026-10-17T10:00:00.000Z".to_string(),
            is_high_res: false,
        }
    }

    struct Unavailable;

    #[async_trait]
    impl Kv for Unavailable {
        async fn get(
            &self,
            _scope: &str,
            _key: &str,
        ) -> anyhow::Result<Option<String>> {
            Err(anyhow!("no storage here"))
        }

        async fn set(
            &self,
            _scope: &str,
            _key: &str,
            _value: &str,
        ) -> anyhow::Result<()> {
            Err(anyhow!("no storage here"))
        }
    }

    #[test]
    fn stale_day_always_allows() {
        for is_premium in [false, true] {
            for count in [0, 3, 4, 100, u32::MAX] {
                assert!(can_generate_on(&user(is_premium, count, YESTERDAY), TODAY));
                assert!(can_generate_on(&user(is_premium, count, ""), TODAY));
            }
        }
    }

    #[test]
    fn premium_always_allows() {
        for count in [0, 2, 3, 50, u32::MAX] {
            assert!(can_generate_on(&user(true, count, TODAY), TODAY));
        }
    }

    #[test]
    fn free_same_day_allows_below_three() {
        for count in 0..10 {
            let allowed = can_generate_on(&user(false, count, TODAY), TODAY);
            assert_eq!(allowed, count < 3, "count={count}");
        }
    }

    #[test]
    fn increment_resets_stale_counter() {
        let before = user(false, 7, YESTERDAY);
        let after = increment_daily_generations_on(&before, TODAY);

        assert_eq!(after.daily_generations, 1);
        assert_eq!(after.last_generation_date, TODAY);
        // Input untouched.
        assert_eq!(before.daily_generations, 7);
        assert_eq!(before.last_generation_date, YESTERDAY);
    }

    #[test]
    fn increment_same_day_adds_one_without_cap() {
        let after = increment_daily_generations_on(&user(false, 3, TODAY), TODAY);
        assert_eq!(after.daily_generations, 4);
        assert_eq!(after.last_generation_date, TODAY);
    }

    #[test]
    fn increment_with_clock() {
        let after = increment_daily_generations(&user(false, 0, ""));
        assert_eq!(after.daily_generations, 1);
        assert_eq!(after.last_generation_date, today());
        assert!(can_generate_today(&after));
    }

    #[test]
    fn remaining_counts_down_and_resets() {
        assert_eq!(remaining_on(&user(false, 0, TODAY), TODAY), Some(3));
        assert_eq!(remaining_on(&user(false, 2, TODAY), TODAY), Some(1));
        assert_eq!(remaining_on(&user(false, 5, TODAY), TODAY), Some(0));
        assert_eq!(remaining_on(&user(false, 3, YESTERDAY), TODAY), Some(3));
        assert_eq!(remaining_on(&user(true, 3, TODAY), TODAY), None);
    }

    #[test]
    fn upgrade_flips_premium_only() {
        let before = user(false, 3, TODAY);
        let after = upgrade(&before);
        assert!(after.is_premium);
        assert_eq!(after.daily_generations, 3);
        assert!(can_generate_on(&after, TODAY));
    }

    #[tokio::test]
    async fn stored_user_reads_back_equal() {
        let store = Entitlements::new(Arc::new(Memory::default()), "client-a");
        assert_eq!(store.user().await, None);

        let u = user(true, 2, TODAY);
        store.set_user(&u).await;
        assert_eq!(store.user().await, Some(u));
    }

    #[tokio::test]
    async fn images_are_newest_first() {
        let store = Entitlements::new(Arc::new(Memory::default()), "client-a");
        assert!(store.images().await.is_empty());

        store.add_image(image("a")).await;
        store.add_image(image("b")).await;
        store.add_image(image("b")).await;

        let ids: Vec<String> =
            store.images().await.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, ["b", "b", "a"]);
    }

    #[tokio::test]
    async fn clients_do_not_share_records() {
        let kv: Arc<dyn Kv> = Arc::new(Memory::default());
        let a = Entitlements::new(kv.clone(), "client-a");
        let b = Entitlements::new(kv, "client-b");

        a.set_user(&user(false, 1, TODAY)).await;
        a.add_image(image("a")).await;

        assert_eq!(b.user().await, None);
        assert!(b.images().await.is_empty());
    }

    #[tokio::test]
    async fn unavailable_storage_is_silent() {
        let store = Entitlements::new(Arc::new(Unavailable), "client-a");

        store.set_user(&user(false, 1, TODAY)).await;
        store.add_image(image("a")).await;

        assert_eq!(store.user().await, None);
        assert!(store.images().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_records_read_as_absent() {
        let kv: Arc<dyn Kv> = Arc::new(Memory::default());
        kv.set("client-a", USER_KEY, "{not json").await.unwrap();
        kv.set("client-a", IMAGES_KEY, "{\"id\": 1}").await.unwrap();
        let store = Entitlements::new(kv, "client-a");

        assert_eq!(store.user().await, None);
        assert!(store.images().await.is_empty());

        // The next write replaces the garbage.
        store.add_image(image("a")).await;
        assert_eq!(store.images().await.len(), 1);
    }

    #[tokio::test]
    async fn stored_json_uses_camel_case() {
        let kv: Arc<dyn Kv> = Arc::new(Memory::default());
        let store = Entitlements::new(kv.clone(), "client-a");
        store.set_user(&user(false, 2, TODAY)).await;

        let raw = kv.get("client-a", USER_KEY).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["isPremium"], false);
        assert_eq!(value["dailyGenerations"], 2);
        assert_eq!(value["lastGenerationDate"], TODAY);
    }
}
