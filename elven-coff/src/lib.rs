#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod consts;
mod idx;
pub mod read;
pub mod write;
