//! Normalized entity model for optistack.
//!
//! Defines the types every cache layer depends on:
//! - [`FieldValue`]: a stored field (scalar, entity reference, list or embedded object)
//! - [`EntityRecord`]: the field map stored under one [`EntityKey`](optistack_types::EntityKey)
//! - [`SchemaRegistry`]: the static typename → id-field lookup used to derive keys
//! - [`Selection`], [`Fragment`], [`QueryDocument`]: statically declared result shapes
//!
//! No query language is parsed here; documents are built in code.

mod entity;
mod schema;
mod selection;
mod value;

pub use entity::EntityRecord;
pub use schema::{EntitySchema, SchemaRegistry, DEFAULT_ID_FIELD, TYPENAME_FIELD};
pub use selection::{Directive, FieldSelection, Fragment, QueryDocument, Selected, Selection};
pub use value::FieldValue;
