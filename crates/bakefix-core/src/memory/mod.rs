mod map;
pub mod patch;

pub use map::*;
