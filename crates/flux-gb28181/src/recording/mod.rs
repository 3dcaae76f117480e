// 后台录像：存储策略与对账循环

pub mod policy;
pub mod reconciler;

pub use policy::{StoragePolicy, StoragePolicyRef};
pub use reconciler::{Reconciler, RecordingStatus, TickReport};
