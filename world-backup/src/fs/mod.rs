//! Filesystem helpers: traversal, exclusion and archive retention.

pub mod ignore;
pub mod retention;
pub mod walker;
