use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::idempotency::{request_fingerprint, StoredResponse, TransactionalHandler};
use crate::models::{EmailPayload, NewsletterIssue, TaskKind};
use crate::outbox::OutboxWriter;
use crate::repositories::StoreTx;

/// Body returned once an issue is accepted for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedIssue {
    pub issue_id: Uuid,
    pub recipients: usize,
}

/// Stores a newsletter issue and queues one delivery per confirmed subscriber.
pub struct PublishIssueHandler {
    title: String,
    text_content: String,
    html_content: String,
}

impl PublishIssueHandler {
    pub fn new(title: &str, text_content: &str, html_content: &str) -> Result<Self> {
        let issue = NewsletterIssue::new(title, text_content, html_content)?;
        Ok(Self {
            title: issue.title,
            text_content: issue.text_content,
            html_content: issue.html_content,
        })
    }
}

#[async_trait]
impl TransactionalHandler for PublishIssueHandler {
    fn operation(&self) -> &'static str {
        "publish_issue"
    }

    fn fingerprint(&self) -> String {
        request_fingerprint([
            self.operation(),
            self.title.as_str(),
            self.text_content.as_str(),
            self.html_content.as_str(),
        ])
    }

    async fn handle(&self, tx: &mut dyn StoreTx) -> Result<StoredResponse> {
        let issue = NewsletterIssue::new(&self.title, &self.text_content, &self.html_content)?;
        tx.insert_newsletter_issue(&issue).await?;

        let writer = OutboxWriter::new();
        let subscribers = tx.list_confirmed_subscribers().await?;
        for subscriber in &subscribers {
            let email = EmailPayload {
                recipient: subscriber.email.clone(),
                subject: issue.title.clone(),
                text_body: issue.text_content.clone(),
                html_body: issue.html_content.clone(),
            };
            writer
                .enqueue_email(tx, TaskKind::SendNewsletterIssue, &email)
                .await?;
        }

        info!(issue_id = %issue.id, recipients = subscribers.len(), "Newsletter issue queued");

        StoredResponse::json(
            202,
            &PublishedIssue {
                issue_id: issue.id,
                recipients: subscribers.len(),
            },
        )
    }
}
