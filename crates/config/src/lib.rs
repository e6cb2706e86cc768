//! Configuration loading, validation and env substitution.
//!
//! Config files: `fleetcron.toml`, `fleetcron.yaml`, or `fleetcron.json`
//! Searched in `./` then `~/.config/fleetcron/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, data_dir, default_database_url, discover_and_load, load_config},
    schema::{
        CronConfig, FleetcronConfig, MetricsConfig, StoreBackend, StoreConfig, SystemJobEntry,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};
