pub mod lifecycle;
pub mod prober;
pub mod registry;

pub use prober::{build_meta_client, probe, Probed};
pub use registry::{UpstreamRegistry, UpstreamState};
