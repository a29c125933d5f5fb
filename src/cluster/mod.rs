//! Cluster-wide state: shared maps, locked maps, discovery and reload signals.

pub mod discovery;
pub mod etcd;
pub mod locked_map;
pub mod membership;
pub mod reload;
pub mod shared_map;

pub use discovery::{ClusterMembership, DeploymentDescriptor, DiscoveryManager, StaticMembership};
pub use etcd::{EtcdConnection, EtcdSharedMap};
pub use locked_map::LockedMap;
pub use membership::{EtcdMembership, EtcdMembershipSync};
pub use reload::{
    EtcdReloadPublisher, EtcdReloadSync, ReloadBus, ReloadHandler, ReloadPublisher,
    ReloadSignal, ReloadTracker,
};
pub use shared_map::{LocalSharedMap, SharedMap};
