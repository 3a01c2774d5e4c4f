pub mod domain;
pub mod error;
pub mod geo;
pub mod protocol;
pub mod style;
