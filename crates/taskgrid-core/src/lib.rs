//! taskgrid-core — shared configuration for the TaskGrid daemon and libraries.
//!
//! The configuration file (`taskgrid.toml`) is parsed once at process start
//! into a [`GridConfig`] and handed by reference to the scheduler, backend
//! constructors, and the worker reconciler.

pub mod config;
pub mod duration;

pub use config::{
    BatchBackendConfig, ConfigError, FleetBackendConfig, GridConfig, LocalBackendConfig,
    ResourceConfig, SchedulerConfig, WorkerConfig, WorkerTemplate,
};
pub use duration::parse_duration;
