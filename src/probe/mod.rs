//! Health probe module.
//!
//! Issues HTTP checks and classifies sites up/down, with a debounce layer
//! that keeps the externally visible status stable under noisy results.

mod debounce;
mod http;

pub use debounce::*;
pub use http::*;
