use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, Result};

const MAX_EMAIL_LENGTH: usize = 254;
const MAX_NAME_LENGTH: usize = 256;
const FORBIDDEN_NAME_CHARS: [char; 9] = ['/', '(', ')', '"', '<', '>', '\\', '{', '}'];

/// Subscription lifecycle. A subscriber is confirmed exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Pending,
    Confirmed,
}

/// A validated, normalized (trimmed, lowercased) email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberEmail(String);

impl SubscriberEmail {
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(AppError::Validation("email cannot be empty".to_string()));
        }
        if normalized.len() > MAX_EMAIL_LENGTH {
            return Err(AppError::Validation(format!(
                "email exceeds {} characters",
                MAX_EMAIL_LENGTH
            )));
        }
        if !validator::validate_email(normalized.as_str()) {
            return Err(AppError::Validation(format!(
                "'{}' is not a valid email address",
                raw.trim()
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SubscriberEmail {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated subscriber display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberName(String);

impl SubscriberName {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("name cannot be empty".to_string()));
        }
        if trimmed.chars().count() > MAX_NAME_LENGTH {
            return Err(AppError::Validation(format!(
                "name exceeds {} characters",
                MAX_NAME_LENGTH
            )));
        }
        if trimmed.chars().any(|c| FORBIDDEN_NAME_CHARS.contains(&c)) {
            return Err(AppError::Validation(
                "name contains forbidden characters".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SubscriberName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validated input for a subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscriber {
    pub email: SubscriberEmail,
    pub name: SubscriberName,
}

impl NewSubscriber {
    pub fn parse(email: &str, name: &str) -> Result<Self> {
        Ok(Self {
            email: SubscriberEmail::parse(email)?,
            name: SubscriberName::parse(name)?,
        })
    }
}

/// A subscriber row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Subscriber {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub status: SubscriberStatus,
    pub created_at: DateTime<Utc>,
}

impl Subscriber {
    /// Creates a pending subscriber from validated input.
    pub fn pending(new_subscriber: &NewSubscriber) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: new_subscriber.email.as_str().to_string(),
            name: new_subscriber.name.as_str().to_string(),
            status: SubscriberStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == SubscriberStatus::Confirmed
    }
}
