//! Pixel format conversion and depth testing helpers used by the software
//! rendering paths and the host display.

pub mod color;
pub mod depth;

pub use color::ColorOps;
pub use depth::{DepthBuffer, DepthFunc};
