//! Core types shared across the scope tree.

mod error;
mod id;

pub use error::ScopeError;
pub use id::{ScopeId, Time};
