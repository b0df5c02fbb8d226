//! Email delivery workers.
//!
//! Consumes queued emails from the broker and hands them to the mail relay,
//! retrying failed sends with exponential backoff and tracking delivery
//! status (`queued → sent | failed`) in the email log.

pub mod consumer;
pub mod relay;
pub mod retry;
