//! Mapping configurations: which source columns become which document fields.
//!
//! Both the auto-mapping suggester and interactive edits go through
//! [`MappingConfiguration::set_field_mapping`].

mod index;
mod model;
mod store;
mod validation;

pub use index::index_mapping;
pub use model::*;
pub use store::{MappingStore, MemoryMappingStore};
pub use validation::{validate_field_mappings, validate_mapping, ValidationReport, ValidationWarning};
