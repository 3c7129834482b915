//! Authentication for the HTTP surface.

pub mod pairing;

pub use pairing::{TokenGuard, constant_time_eq};
