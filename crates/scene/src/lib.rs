pub mod spatial;
pub mod visible_set;

pub use spatial::*;
pub use visible_set::*;
