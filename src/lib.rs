#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! portrelay library: the device side of a relay tunnel.
//!
//! - `tunnel` is the agent, its relay connections, and the stream handlers
//! - `config` loads the TOML configuration
//! - `state` holds connection statistics and recent events

pub mod config;
pub mod error;
pub mod state;
pub mod tunnel;

pub use config::Config;
pub use error::{ConfigError, TunnelError};
pub use state::TunnelStats;
pub use tunnel::Agent;
