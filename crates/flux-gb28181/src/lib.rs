// flux-gb28181: GB28181 视频监控控制面
//
// 架构设计：
// - 信令：平台侧 SIP 服务（注册/保活/目录/点播/回放/订阅/云台）
// - 编排：同一通道一路流，多观看者共享；后台录像固定占用
// - 媒体：ZLMediaKit 负责 RTP 接收、转封装与录制

pub mod control;
pub mod directory;
pub mod error;
pub mod media;
pub mod notify;
pub mod playback;
pub mod preview;
pub mod recording;
pub mod sip;

#[cfg(test)]
pub(crate) mod testing;

// 重新导出常用类型
pub use control::DeviceControl;
pub use directory::{Channel, Codec, Device, DeviceDirectory, DeviceDirectoryRef, MemoryDirectory, Transport};
pub use error::{Gb28181Error, Result};
pub use media::{MediaGateway, MediaGatewayRef, PlayUrls, ZlmClient};
pub use notify::NotificationStore;
pub use playback::PlaybackService;
pub use preview::{PreviewOrchestrator, StartPreview};
pub use recording::{Reconciler, StoragePolicy, StoragePolicyRef};
pub use sip::{Signaling, SignalingEngine, SignalingRef};
