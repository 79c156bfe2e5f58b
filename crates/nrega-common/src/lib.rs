//! MGNREGA Common Library
//!
//! Shared pieces used by every MGNREGA statistics crate: the common error
//! type and the logging subsystem.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;

pub use error::{NregaError, Result};
