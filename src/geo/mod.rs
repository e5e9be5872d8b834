//! Geographic value types

mod extents;

pub use extents::Extents;
