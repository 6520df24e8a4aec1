mod integration;

pub use integration::prelude;
