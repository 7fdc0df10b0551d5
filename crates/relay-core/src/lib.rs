//! Shared runtime substrate for the tracker relay.
//!
//! Tracker, forwarder and dispatcher modules never touch files or OAuth endpoints
//! themselves. They receive a [`module::ModuleDependencies`] bundle holding the
//! persisted [`state::StateStore`], the [`token::TokenManager`] and the outbound
//! messenger, and the [`supervisor::Supervisor`] owns their start/stop lifecycle.

pub mod config;
pub mod domain;
pub mod errors;
pub mod fsutil;
pub mod logging;
pub mod messaging;
pub mod module;
pub mod modules;
pub mod scheduler;
pub mod signals;
pub mod state;
pub mod supervisor;
pub mod token;

pub use errors::{Error, Result};
