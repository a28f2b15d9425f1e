//! A fleet installer: plugins declare parameters, modules, resources, and
//! ordered phase callables; the [`controller::Controller`] provisions one
//! [`drone::Drone`] per host, plans a marker DAG, builds and ships each
//! host's tree, then deploys it while tailing logs through the
//! [`logcheck::LogChecker`].

pub mod config;
pub mod controller;
pub mod drone;
pub mod error;
pub mod logcheck;
pub mod manifest;
pub mod plan;
pub mod plugin;
pub mod rsh;
pub mod status;
pub mod strings;
pub mod tt;

pub use error::{Error, Result};
