// ABOUTME: Change-capture routing and batching engine library
// ABOUTME: Reads captured changes inside gaps, routes them to nodes and seals batches

pub mod batch;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod gap;
pub mod lock;
pub mod model;
pub mod pipeline;
pub mod reader;
pub mod routing;
pub mod stats;
pub mod utils;

pub use engine::RoutingEngine;
pub use error::{ErrorCategory, Result, RouteError};
