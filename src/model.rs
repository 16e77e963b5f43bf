use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    #[sqlx(rename = "user_id")]
    pub owner_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Resource {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub digest: String,
    #[sqlx(rename = "user_id")]
    pub owner_id: i64,
    pub created_at: String,
}

/// Minimal projection handed to the oracle during resource narrowing.
///
/// Carries no url or digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub id: i64,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewResource {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Resource),
    AlreadyExists,
}

/// Shape rendered by the UI's resource card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceCard {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub digest: String,
    pub tags: Vec<String>,
    pub created_at: Option<String>,
}

impl ResourceCard {
    pub fn from_resource(resource: &Resource, tags: Vec<String>) -> Self {
        Self {
            id: resource.id,
            title: resource.title.clone(),
            url: resource.url.clone(),
            digest: resource.digest.clone(),
            tags,
            created_at: Some(resource.created_at.clone()).filter(|value| !value.is_empty()),
        }
    }
}
