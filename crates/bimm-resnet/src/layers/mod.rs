//! Common low-level layer factories and blocks.
pub mod blocks;
pub mod conv;
