pub mod devices;
pub mod health;
pub mod notifications;
pub mod preferences;
pub mod webhooks;
pub mod ws;
