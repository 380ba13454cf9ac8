//! Continuous face verification: confirm once that the person at the camera
//! matches an approved reference photo, then keep checking while the session
//! lasts and raise alerts when the check fails or cannot be made.

pub mod capture;
pub mod errors;
pub mod faces;
pub mod session;

pub use errors::{AppError, AppResult};
