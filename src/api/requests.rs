use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::NewSubscriber;
use crate::services::PublishIssueHandler;

/// A field that failed [`SubscribeRequest::validate`] or [`PublishIssueRequest::validate`].
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

/// Form body of a subscription request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub email: String,
    pub name: String,
}

impl SubscribeRequest {
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.email.trim().is_empty() {
            errors.push(ValidationError::new("email", "email cannot be empty"));
        }
        if self.name.trim().is_empty() {
            errors.push(ValidationError::new("name", "name cannot be empty"));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Converts into typed domain values.
    pub fn into_new_subscriber(self) -> Result<NewSubscriber> {
        NewSubscriber::parse(&self.email, &self.name)
    }
}

/// Query string of the confirmation link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmQuery {
    pub token: String,
}

/// JSON body of a newsletter publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishIssueRequest {
    pub title: String,
    pub text_content: String,
    pub html_content: String,
}

impl PublishIssueRequest {
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.title.trim().is_empty() {
            errors.push(ValidationError::new("title", "title cannot be empty"));
        }
        if self.text_content.trim().is_empty() {
            errors.push(ValidationError::new("text_content", "text_content cannot be empty"));
        }
        if self.html_content.trim().is_empty() {
            errors.push(ValidationError::new("html_content", "html_content cannot be empty"));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    pub fn into_handler(self) -> Result<PublishIssueHandler> {
        PublishIssueHandler::new(&self.title, &self.text_content, &self.html_content)
    }
}
