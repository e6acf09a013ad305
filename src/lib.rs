pub mod annotate;
pub mod batch;
pub mod config;
pub mod detector;
