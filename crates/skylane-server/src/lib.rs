//! Shared library surface for the route planning server and its tools.

pub mod api;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod route_planner;
pub mod state;
pub mod terrain;
pub mod tiles;
