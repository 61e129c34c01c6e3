pub mod analyzer;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod events;
pub mod health;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod recovery;
pub mod router;
pub mod session;
pub mod state;
pub mod step;
pub mod vcs;
pub mod watchdog;

pub use error::{ForemanError, Result};
