//! Work request builders.

mod send;

pub use self::send::*;
