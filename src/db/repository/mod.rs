pub mod delivery;
pub mod device_token;
pub mod notification;
pub mod notification_type;
pub mod preference;
pub mod user;

pub use delivery::DeliveryRepository;
pub use device_token::DeviceTokenRepository;
pub use notification::NotificationRepository;
pub use notification_type::NotificationTypeRepository;
pub use preference::PreferenceRepository;
pub use user::UserRepository;
