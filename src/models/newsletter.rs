use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{AppError, Result};

/// A published newsletter issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct NewsletterIssue {
    pub id: Uuid,
    pub title: String,
    pub text_content: String,
    pub html_content: String,
    pub published_at: DateTime<Utc>,
}

impl NewsletterIssue {
    pub fn new(title: &str, text_content: &str, html_content: &str) -> Result<Self> {
        if title.trim().is_empty() {
            return Err(AppError::Validation("title cannot be empty".to_string()));
        }
        if text_content.trim().is_empty() {
            return Err(AppError::Validation("text content cannot be empty".to_string()));
        }
        if html_content.trim().is_empty() {
            return Err(AppError::Validation("html content cannot be empty".to_string()));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            title: title.trim().to_string(),
            text_content: text_content.to_string(),
            html_content: html_content.to_string(),
            published_at: Utc::now(),
        })
    }
}
