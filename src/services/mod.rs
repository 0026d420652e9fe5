pub mod dispatch;
pub mod email;
pub mod init;
pub mod notifications;
pub mod preferences;
pub mod push;
pub mod webhooks;
pub mod websocket;
