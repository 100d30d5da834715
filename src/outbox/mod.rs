//! Transactional outbox: tasks are written with the business mutation and
//! executed later by [`OutboxDispatcher`].

pub mod dispatcher;
pub mod retention;
pub mod sender;
pub mod writer;

pub use dispatcher::{DispatchReport, DispatcherConfig, OutboxDispatcher};
pub use retention::RetentionJob;
pub use sender::{EmailSender, HttpEmailSender};
pub use writer::OutboxWriter;
