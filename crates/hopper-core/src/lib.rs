pub mod agent;
pub mod auth;
pub mod config;
pub mod error;
pub mod inbox;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod runtime;
pub mod store;

pub use error::{HopperError, Result};
