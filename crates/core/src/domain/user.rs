use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External identity of a user on the messaging platform. The pair is unique.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformIdentity {
    pub platform_user_id: String,
    pub workspace_id: String,
}

impl PlatformIdentity {
    pub fn new(platform_user_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self { platform_user_id: platform_user_id.into(), workspace_id: workspace_id.into() }
    }

    /// Stable key used for rate-limit buckets and audit attribution before the
    /// user row has been resolved.
    pub fn key(&self) -> String {
        format!("{}:{}", self.workspace_id, self.platform_user_id)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    #[default]
    Es,
    En,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Es => "es",
            Self::En => "en",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "es" | "spanish" | "espanol" | "español" => Some(Self::Es),
            "en" | "english" | "ingles" | "inglés" => Some(Self::En),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub language: Language,
    pub timezone: String,
    pub notifications_enabled: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            language: Language::Es,
            timezone: "America/Mexico_City".to_owned(),
            notifications_enabled: true,
        }
    }
}

impl UserPreferences {
    pub fn validate(&self) -> Result<(), DomainError> {
        let tz = self.timezone.trim();
        let looks_like_zone = tz == "UTC"
            || (tz.contains('/')
                && tz.split('/').all(|part| {
                    !part.is_empty()
                        && part.chars().all(|ch| ch.is_ascii_alphanumeric() || "_-+".contains(ch))
                }));
        if !looks_like_zone {
            return Err(DomainError::Validation(format!(
                "`{tz}` is not a timezone name (expected e.g. `America/Mexico_City` or `UTC`)"
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub identity: PlatformIdentity,
    pub display_name: Option<String>,
    pub preferences: UserPreferences,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{Language, PlatformIdentity, UserPreferences};

    #[test]
    fn identity_key_is_workspace_scoped() {
        let identity = PlatformIdentity::new("U123", "T999");
        assert_eq!(identity.key(), "T999:U123");
    }

    #[test]
    fn language_accepts_both_languages_names() {
        assert_eq!(Language::parse("English"), Some(Language::En));
        assert_eq!(Language::parse("español"), Some(Language::Es));
        assert_eq!(Language::parse("fr"), None);
    }

    #[test]
    fn timezone_validation_rejects_free_text() {
        let mut prefs = UserPreferences::default();
        assert!(prefs.validate().is_ok());

        prefs.timezone = "UTC".to_owned();
        assert!(prefs.validate().is_ok());

        prefs.timezone = "my house".to_owned();
        assert!(prefs.validate().is_err());
    }
}
