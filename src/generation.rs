use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use axum::http::StatusCode;
use chrono::{SecondsFormat, Utc};

use crate::{
    data::Kv,
    entitlement::{self, Entitlements},
    types::{GeneratedImage, Generation, User, UserStatus},
    upstream::{GenerateError, Upstream},
};

/// Conditions under which a request never reaches upstream.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("Sign in required")]
    SignInRequired,

    #[error("Daily generation limit reached")]
    QuotaExceeded,

    #[error("Prompt is required")]
    PromptRequired,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::SignInRequired => StatusCode::UNAUTHORIZED,
            Self::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
            Self::PromptRequired => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Failed(#[from] GenerateError),
}

impl GenerationError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Rejected(rejection) => rejection.status(),
            Self::Failed(error) => error.status(),
        }
    }
}

type ClientLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Sequences entitlement checks, the upstream call and the commit of a
/// successful generation.
///
/// All mutations of a client's records go through a per-client lock, so two
/// overlapping requests from the same client run one after the other and
/// the second one sees the first one's counter.
pub struct Generator {
    kv: Arc<dyn Kv>,
    upstream: Upstream,
    locks: ClientLocks,
}

/// Handle on one client's lock. The map entry is dropped together with the
/// last handle.
struct ClientLock<'a> {
    locks: &'a ClientLocks,
    client: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl ClientLock<'_> {
    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for ClientLock<'_> {
    fn drop(&mut self) {
        let mut locks =
            self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Ours and the map's.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.client);
        }
    }
}

impl Generator {
    pub fn new(kv: Arc<dyn Kv>, upstream: Upstream) -> Self {
        Self {
            kv,
            upstream,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn entitlements(&self, client: &str) -> Entitlements {
        Entitlements::new(self.kv.clone(), client)
    }

    fn lock_for(&self, client: &str) -> ClientLock<'_> {
        let mut locks =
            self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = locks.entry(client.to_string()).or_default().clone();
        ClientLock {
            locks: &self.locks,
            client: client.to_string(),
            lock,
        }
    }

    /// Returns the stored user, creating one on first sign-in.
    #[tracing::instrument(skip_all)]
    pub async fn sign_in(&self, client: &str, email: &str) -> User {
        let lock = self.lock_for(client);
        let _guard = lock.lock().await;
        let store = self.entitlements(client);
        if let Some(user) = store.user().await {
            return user;
        }
        let user = User::new(email.trim());
        store.set_user(&user).await;
        tracing::info!(user_id = %user.id, "Created user.");
        user
    }

    /// Client-side flag flip. No payment happens anywhere.
    #[tracing::instrument(skip_all)]
    pub async fn upgrade(&self, client: &str) -> Result<User, Rejection> {
        let lock = self.lock_for(client);
        let _guard = lock.lock().await;
        let store = self.entitlements(client);
        let user = store.user().await.ok_or(Rejection::SignInRequired)?;
        let user = entitlement::upgrade(&user);
        store.set_user(&user).await;
        tracing::info!(user_id = %user.id, "Upgraded to premium.");
        Ok(user)
    }

    pub async fn status(&self, client: &str) -> Result<UserStatus, Rejection> {
        let user = self
            .entitlements(client)
            .user()
            .await
            .ok_or(Rejection::SignInRequired)?;
        let remaining_today = entitlement::remaining_today(&user);
        Ok(UserStatus {
            user,
            remaining_today,
        })
    }

    pub async fn images(&self, client: &str) -> Vec<GeneratedImage> {
        self.entitlements(client).images().await
    }

    /// Runs one generation for `client`. Only a successful upstream call
    /// advances the counter and adds to the gallery.
    #[tracing::instrument(skip_all)]
    pub async fn generate(
        &self,
        client: &str,
        prompt: &str,
    ) -> Result<Generation, GenerationError> {
        let lock = self.lock_for(client);
        let _guard = lock.lock().await;
        let store = self.entitlements(client);

        let user = store.user().await.ok_or(Rejection::SignInRequired)?;
        if !entitlement::can_generate_today(&user) {
            tracing::info!(user_id = %user.id, "Daily limit reached.");
            return Err(Rejection::QuotaExceeded.into());
        }
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(Rejection::PromptRequired.into());
        }

        let image_url = self.upstream.generate(prompt).await?;

        let now = Utc::now();
        let newest = store.images().await.into_iter().next();
        let image = GeneratedImage {
            id: next_image_id(now.timestamp_millis(), newest.as_ref()),
            prompt: prompt.to_string(),
            image_url,
            created_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            is_high_res: user.is_premium,
        };
        let user = entitlement::increment_daily_generations(&user);
        store.set_user(&user).await;
        store.add_image(image.clone()).await;
        tracing::info!(
            user_id = %user.id,
            daily_generations = user.daily_generations,
            "Generated image."
        );
        Ok(Generation { image, user })
    }
}

/// Epoch milliseconds, bumped past the client's newest image so that ids
/// stay unique and increasing within one gallery.
fn next_image_id(now_ms: i64, newest: Option<&GeneratedImage>) -> String {
    newest
        .and_then(|image| image.id.parse::<i64>().ok())
        .map_or(now_ms, |id| now_ms.max(id.saturating_add(1)))
        .to_string()
}
