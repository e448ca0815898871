pub mod controller;
pub mod model;
pub mod resources;
pub mod schedule;

pub use controller::*;

#[cfg(test)]
pub mod fixtures;
