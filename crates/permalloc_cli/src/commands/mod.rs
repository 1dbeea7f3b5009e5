//! CLI command implementations.

pub mod check;
pub mod copy;
pub mod describe;
pub mod info;
pub mod ls;
pub mod remove;
