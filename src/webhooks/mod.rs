//! Admission webhooks for Etcd validation
//!
//! Rejects specs the controller could never realise and changes to fields
//! that are fixed once the cluster exists. The controller repeats the spec
//! checks itself, so the webhook is optional.

pub mod policies;
mod server;

pub use policies::{ValidationContext, ValidationResult};
pub use server::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WebhookError, create_webhook_router, run_webhook_server};
