#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod adapter;
pub mod config;
pub mod decompose;
pub mod dispatch;
pub mod io;
pub mod matrix;
pub mod numeric;
pub mod permute;
pub mod progress;
pub mod summary;
pub mod types;
