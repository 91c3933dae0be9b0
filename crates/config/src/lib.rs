//! Configuration for the berth control plane.
//!
//! One explicit [`BerthConfig`] value is loaded at startup and plumbed into
//! the services that need it; nothing reads the process environment after
//! boot except through `${VAR}` substitution at load time.

mod env_subst;
mod loader;
mod schema;

pub use {
    loader::{discover_and_load, load_config},
    schema::*,
};
