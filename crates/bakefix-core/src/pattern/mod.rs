mod element;
mod scanner;

pub use element::*;
pub use scanner::*;
