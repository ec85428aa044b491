//! Overlay layers: reconciling a dataset of renderable items against a
//! rendering surface, one bounded commit per frame.

pub mod commit;
pub mod config;
pub mod interaction;
pub mod item;
pub mod layer;
pub mod lod;
pub mod overlay;
pub mod surface;
pub mod telemetry;
pub mod viewport;

pub use commit::*;
pub use config::*;
pub use interaction::*;
pub use item::*;
pub use layer::*;
pub use lod::*;
pub use overlay::*;
pub use surface::*;
pub use telemetry::*;
pub use viewport::*;
