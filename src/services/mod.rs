pub mod newsletter_service;
pub mod subscription_service;

pub use newsletter_service::{PublishIssueHandler, PublishedIssue};
pub use subscription_service::{
    confirmation_email, generate_subscription_token, SubscribeHandler, SubscriptionService,
    CONFIRMATION_SUBJECT, SUBSCRIPTION_TOKEN_LENGTH,
};
