/// Builder for constructing pipeline instances.
pub mod builder;
/// The event pipeline: intake routing, scheduler pump, and admin surface.
pub mod pipeline;

pub use builder::EventPipelineBuilder;
pub use pipeline::{EventHandler, EventPipeline, ShutdownToken};
