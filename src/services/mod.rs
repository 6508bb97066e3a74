pub mod credential_cache;
pub mod daraja_client;
pub mod notifier;
pub mod phone;
pub mod reconciler;
