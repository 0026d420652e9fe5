//! Database models split into separate files.
//! This module re-exports individual model modules so imports like
//! `use crate::db::models::*;` work across the crate.

pub mod delivery;
pub mod device_token;
pub mod notification;
pub mod notification_type;
pub mod preference;
pub mod user;

pub use self::delivery::*;
pub use self::device_token::*;
pub use self::notification::*;
pub use self::notification_type::*;
pub use self::preference::*;
pub use self::user::*;
