// Entry points for embedding applications.

pub mod adapters;
pub mod simple;
