pub mod errors;
pub mod events;
pub mod ids;
pub mod rpc;

pub use errors::{DeviceError, ErrorCode, SubscriptionError};
pub use events::{ButtonEvent, EdgeKind};
pub use ids::ConnectionId;
