//! Operational HTTP surface and process wiring for the job queue.

pub mod app;
