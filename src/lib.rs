// Clippy allows for reasonable defaults
#![allow(clippy::too_many_arguments)] // Coordinator wiring needs many collaborators
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::derivable_impls)] // Explicit Default impls can be clearer
#![allow(clippy::field_reassign_with_default)] // Builder pattern is clearer

// Module declarations
pub mod approval;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod models;
pub mod parallel;
pub mod storage;
mod utils;
pub mod workspace;

// Re-export models and the error taxonomy for callers
pub use error::{ParallelError, ParallelResult};
pub use models::*;
pub use parallel::coordinator::{CoordinatorBuilder, ParallelCoordinator};
