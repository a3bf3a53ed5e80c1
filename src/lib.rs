pub mod backend;
pub mod bus;
pub mod graph;
pub mod message;
pub mod mixer;
pub mod render;
pub mod ring;
pub mod timing;
pub mod wire;

pub use bus::AudioBus;

/// The number of frames rendered by each call to
/// [`render::RenderSession::render_quantum`].
///
/// Control messages take effect on quantum boundaries, so this value
/// is a balance between command latency and per-block overhead. Lower
/// values react faster but spend more time in scheduling, higher
/// values amortize better but delay parameter changes. (The value
/// must also be a power of two.)
pub const QUANTUM_FRAMES: usize = 128;

/// The maximum number of channels a single bus may carry.
pub const MAX_CHANNELS: usize = 32;
