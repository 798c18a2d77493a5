//! Alert engine and notification channels.

mod channels;
mod engine;

pub use channels::*;
pub use engine::*;
