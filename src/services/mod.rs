pub mod bootstrap;
pub mod clock;
pub mod ebpf_loader;
pub mod event_loop;
pub mod renderer;
pub mod sink;
pub mod tracker;

pub use event_loop::EventLoop;
pub use sink::{spawn_forwarder, RemoteSink};
pub use tracker::{ProcessTreeTracker, ReapBoundaries, TrackerConfig};
