pub mod camera;
pub mod error;
pub mod geometry;
pub mod io;
pub mod mapping;
pub mod markers;
pub mod optimizer;
pub mod system;
pub mod tracking;

#[cfg(test)]
mod testing;
