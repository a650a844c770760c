//! camlink - serverless camera pairing
//!
//! Pairs a camera-carrying host with a viewing client over a direct WebRTC
//! link. Offer and answer travel out of band as optical codes (or pasted
//! text); once connected the client drives the host's camera over a JSON
//! control channel.

pub mod advisor;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod exchange;
pub mod negotiation;
pub mod session;
pub mod utils;
pub mod wake_lock;
pub mod webrtc;

pub use error::{AppError, Result};
pub use session::{SessionController, SessionOptions};
