pub mod budget;
pub mod clock;
pub mod event_bus;
pub mod frame;
pub mod metrics;
pub mod write_queue;

pub use budget::*;
pub use clock::*;
pub use event_bus::*;
pub use frame::*;
pub use metrics::*;
pub use write_queue::*;
