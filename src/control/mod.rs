//! Control channel protocol
//!
//! Fire-and-forget JSON commands carried on the session's data channel once
//! the session is connected. No acknowledgements, no sequence numbers: a
//! capture request is paired with the next photo only by arrival order.

pub mod device;
pub mod handler;
pub mod message;

pub use device::{CameraDevice, CapturedFrame, NullCamera, StillImageCamera};
pub use handler::ControlHandler;
pub use message::{parse_control_message, ControlMessage, ZoomRange};
