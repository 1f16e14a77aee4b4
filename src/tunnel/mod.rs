//! Tunnel core: the channel-backed stream, per-site state, and the
//! registry/resolver that the proxy-side surface queries.

pub mod registry;
pub mod site;
pub mod stream;

pub use registry::SiteRegistry;
pub use site::{ConnectionHandle, Site, SiteConnection, SiteStatus};
pub use stream::ChannelStream;
