pub mod controller;
pub mod events;
pub mod executor;
pub mod negotiation;
pub mod probe;
pub mod text;

pub use controller::SessionController;
pub use events::{ChannelSink, EventSink, NoopSink, SessionEvent};
pub use executor::SessionExecutor;
pub use negotiation::{Backend, Precision, Resolution, resolve};
pub use probe::{CapabilityProbe, MemoizedProbe, StaticProbe};
