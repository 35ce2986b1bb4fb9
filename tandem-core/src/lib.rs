//! # tandem-core: Document model for Tandem
//!
//! Typed shapes and groups, their validation and sanitization, and the
//! mapping of those objects onto entries of a replicated `yrs` map.
//!
//! ## Modules
//!
//! - [`model`]: `Shape`, `Group`, partial updates, sanitization
//! - [`entries`]: flat `"{id}/{field}"` layout inside a `yrs::MapRef`
//! - [`error`]: validation errors

pub mod entries;
pub mod error;
pub mod model;

pub use error::ModelError;
pub use model::{
    Group, GroupPatch, Point, Rect, Shape, ShapeKind, ShapePatch, Size, Style, StylePatch,
    TextAlign, TextStyle, MAX_TEXT_LENGTH,
};
