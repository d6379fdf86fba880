//! # Composite layer blocks.
pub mod cna;
