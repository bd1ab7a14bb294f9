//! Cluster Scheduler Library
//!
//! Core library modules for a clustered job scheduler: job definitions and
//! their store, run coordination through a shared cache, leader election,
//! the scheduling loop and the worker pool.

use shadow_rs::shadow;
shadow!(build);

pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod logger;
pub mod node;
pub mod notifications;
pub mod schema;

pub use node::{Node, NodeComponents};

pub fn pkg_version() -> &'static str {
    build::PKG_VERSION
}
