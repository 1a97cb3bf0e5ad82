pub mod handle;
pub mod per_request;
pub mod provider;
pub mod registry;
pub mod shared;
pub mod tracker;
pub mod view;

pub use handle::{HandleId, SnapshotHandle};
pub use per_request::PerRequestProvider;
pub use provider::{ProviderKind, ViewLease, ViewProvider};
pub use registry::HandleRegistry;
pub use shared::SharedViewPool;
pub use tracker::LatestSnapshotTracker;
pub use view::CompositeView;
