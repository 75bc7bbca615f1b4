//! Model implementations.

pub mod vidtok;
