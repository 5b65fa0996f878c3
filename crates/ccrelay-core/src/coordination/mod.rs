//! Leader/Follower coordination channel (spec §4.8): lets one process tell
//! its peers about a provider switch or impending shutdown over a small
//! WebSocket protocol.

mod follower;
mod leader;
mod message;

pub use follower::{ConnState, Follower, FollowerState};
pub use leader::Leader;
pub use message::{Envelope, MessageType};
