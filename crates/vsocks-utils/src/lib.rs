mod arrayvec;
mod assert;

pub use arrayvec::{ArrayStr, ArrayVec};
