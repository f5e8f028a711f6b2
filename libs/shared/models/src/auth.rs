use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: Option<u64>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub app_metadata: Option<serde_json::Value>,
    pub user_metadata: Option<serde_json::Value>,
    pub aud: Option<String>,
    pub iat: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Dashboard roles recognised by the clinic office front end.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DashboardRole {
    Obgyn,
    Secretary,
}

impl DashboardRole {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "obgyn" | "ob-gyn" | "doctor" => Some(DashboardRole::Obgyn),
            "secretary" => Some(DashboardRole::Secretary),
            _ => None,
        }
    }
}

impl User {
    /// Resolves the dashboard role from user metadata, falling back to the role claim.
    pub fn dashboard_role(&self) -> Option<DashboardRole> {
        self.metadata
            .as_ref()
            .and_then(|meta| meta.get("role"))
            .and_then(|role| role.as_str())
            .and_then(DashboardRole::parse)
            .or_else(|| self.role.as_deref().and_then(DashboardRole::parse))
    }
}
