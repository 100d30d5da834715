use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tracing::info;

use crate::error::{AppError, Result};
use crate::idempotency::{request_fingerprint, HeaderPair, StoredResponse, TransactionalHandler};
use crate::models::{EmailPayload, NewSubscriber, Subscriber, SubscriberEmail, TaskKind};
use crate::observability::mask_email;
use crate::outbox::OutboxWriter;
use crate::repositories::{Store, StoreTx};

pub const CONFIRMATION_SUBJECT: &str = "Confirm Your Subscription!";
pub const SUBSCRIPTION_TOKEN_LENGTH: usize = 25;

/// Letters a confirmation token is drawn from.
const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random ASCII-letter token identifying one confirmation link.
pub fn generate_subscription_token() -> String {
    let mut rng = rand::thread_rng();
    (0..SUBSCRIPTION_TOKEN_LENGTH)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

/// Builds the confirmation message for one subscription request.
pub fn confirmation_email(base_url: &str, recipient: &SubscriberEmail, token: &str) -> EmailPayload {
    let link = format!(
        "{}/subscriptions/confirm?token={}",
        base_url.trim_end_matches('/'),
        token
    );
    EmailPayload {
        recipient: recipient.as_str().to_string(),
        subject: CONFIRMATION_SUBJECT.to_string(),
        text_body: format!(
            "Welcome to our newsletter!\nVisit {} to confirm your subscription.",
            link
        ),
        html_body: format!(
            "Welcome to our newsletter!<br />Click <a href=\"{}\">here</a> to confirm your subscription.",
            link
        ),
    }
}

/// Creates a pending subscriber and queues its confirmation email.
pub struct SubscribeHandler {
    new_subscriber: NewSubscriber,
    base_url: String,
}

impl SubscribeHandler {
    pub fn new(new_subscriber: NewSubscriber, base_url: impl Into<String>) -> Self {
        Self {
            new_subscriber,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl TransactionalHandler for SubscribeHandler {
    fn operation(&self) -> &'static str {
        "subscribe"
    }

    fn fingerprint(&self) -> String {
        request_fingerprint([
            self.operation(),
            self.new_subscriber.email.as_str(),
            self.new_subscriber.name.as_str(),
        ])
    }

    async fn handle(&self, tx: &mut dyn StoreTx) -> Result<StoredResponse> {
        let subscriber = Subscriber::pending(&self.new_subscriber);
        tx.insert_subscriber(&subscriber).await?;

        let token = generate_subscription_token();
        tx.insert_subscription_token(subscriber.id, &token).await?;

        let email = confirmation_email(&self.base_url, &self.new_subscriber.email, &token);
        let task_id = OutboxWriter::new()
            .enqueue_email(tx, TaskKind::SendConfirmationEmail, &email)
            .await?;

        info!(
            subscriber_id = %subscriber.id,
            email = %mask_email(&subscriber.email),
            task_id = %task_id,
            "Subscriber created, confirmation queued"
        );

        let mut response = StoredResponse::json(201, &subscriber)?;
        response
            .headers
            .push(HeaderPair::new("location", format!("/subscriptions/{}", subscriber.id)));
        Ok(response)
    }
}

/// Subscription reads and the confirmation flow.
pub struct SubscriptionService {
    store: Arc<dyn Store>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Confirms the subscriber behind `token`. Confirming twice is a no-op.
    pub async fn confirm(&self, token: &str) -> Result<Subscriber> {
        let token = token.trim();
        if token.is_empty() || token.len() > SUBSCRIPTION_TOKEN_LENGTH * 4 {
            return Err(AppError::Validation("malformed subscription token".to_string()));
        }

        let mut tx = self.store.begin().await?;
        let subscriber_id = tx
            .find_subscriber_id_by_token(token)
            .await?
            .ok_or_else(|| AppError::NotFound("Unknown subscription token".to_string()))?;

        let subscriber = tx
            .confirm_subscriber(subscriber_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Subscriber {} not found", subscriber_id)))?;
        tx.commit().await?;

        info!(subscriber_id = %subscriber.id, "Subscription confirmed");
        Ok(subscriber)
    }
}
