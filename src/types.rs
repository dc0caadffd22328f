use utoipa::ToSchema;

/// One client's account and entitlement state, stored as JSON in the
/// client's namespace.
#[derive(serde::Serialize, serde::Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub is_premium: bool,
    pub daily_generations: u32,
    /// Quota day (`YYYY-MM-DD`, local) the counter applies to. Empty until
    /// the first generation.
    pub last_generation_date: String,
}

impl User {
    pub fn new(email: &str) -> Self {
        Self {
            id: cuid2::create_id(),
            email: email.to_string(),
            is_premium: false,
            daily_generations: 0,
            last_generation_date: String::new(),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    /// Creation time in Unix epoch milliseconds.
    pub id: String,
    pub prompt: String,
    pub image_url: String,
    /// RFC 3339, UTC.
    pub created_at: String,
    #[serde(default)]
    pub is_high_res: bool,
}

#[derive(serde::Serialize, serde::Deserialize, ToSchema, Debug)]
pub struct GenerateReq {
    #[serde(default)]
    pub prompt: String,
}

#[derive(serde::Serialize, serde::Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResp {
    pub image_url: String,
}

#[derive(serde::Serialize, serde::Deserialize, ToSchema, Debug)]
pub struct SessionReq {
    pub email: String,
}

#[derive(serde::Serialize, serde::Deserialize, ToSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub user: User,
    /// Generations left today. Absent for premium users.
    pub remaining_today: Option<u32>,
}

/// Outcome of a committed generation.
#[derive(serde::Serialize, serde::Deserialize, ToSchema, Debug, Clone)]
pub struct Generation {
    pub image: GeneratedImage,
    pub user: User,
}
