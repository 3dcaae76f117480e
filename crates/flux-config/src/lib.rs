// flux-config: GB28181 控制面配置
//
// global.toml 单文件，按段划分：
// - [system] [log] [http]  进程级
// - [sip]                  信令引擎
// - [media] [preview]      流媒体网关与预览策略
// - [recording]            存储策略（后台录制）
// - [[devices]]            内存设备目录的种子数据

pub mod global;
pub mod loader;
pub mod media;
pub mod recording;
pub mod sip;

pub use global::{GlobalConfig, HttpConfig, LogConfig, SystemConfig};
pub use loader::ConfigLoader;
pub use media::{MediaConfig, PreviewConfig};
pub use recording::RecordingConfig;
pub use sip::{ChannelSeed, DeviceSeed, SipConfig};
