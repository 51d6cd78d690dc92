//! pixelpipe image processing pipeline
//!
//! Jobs name a source image URL and the derivatives wanted from it. Each job is
//! downloaded, inspected, and stored as an original plus a thumbnail and
//! resized renditions in S3-compatible storage. Jobs arrive from a Redis queue
//! (the `worker` binary) or synchronously over HTTP (the server).

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
