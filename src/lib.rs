pub mod cloud;
pub mod config;
pub mod daemon;
pub mod deployment;
pub mod error;
pub mod ops;
pub mod queue;
pub mod reconciler;
