pub mod newsletter;
pub mod outbox_task;
pub mod subscriber;

pub use newsletter::NewsletterIssue;
pub use outbox_task::{EmailPayload, OutboxTask, TaskKind, TaskStatus, CLAIM_EXPIRED};
pub use subscriber::{NewSubscriber, Subscriber, SubscriberEmail, SubscriberName, SubscriberStatus};
