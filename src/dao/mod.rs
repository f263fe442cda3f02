//! Generic data access objects.
//!
//! - [`Entity`]: what a row type declares about its table
//! - [`Dao`]: CRUD, paging and the escape hatch, one scope per call
//! - [`BackgroundTask`] and the `*_ff` variants: writes on the shared
//!   background runtime
//! - [`BlockingDao`]: the same operations for synchronous callers

pub mod background;
pub mod blocking;
pub mod engine;
pub mod entity;

pub use background::{
    BackgroundTask, TaskStatus, runtime_starts, shutdown_background, submit, worker_count,
};
pub use blocking::BlockingDao;
pub use engine::Dao;
pub use entity::{Entity, TableDescriptor, entity_from_record, fields_to_record};
