// Session lifecycle: identity, heartbeats, sibling signals and staleness scans.

pub mod broadcast;
pub mod clock;
pub mod registry;

pub use broadcast::{Broadcast, FileBroadcast, LocalBroadcast, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use registry::{Phase, SessionRegistry};
