// flux-shutdown: 优雅关闭
//
// 信号（SIGTERM / SIGINT / 手动）触发后，按优先级依次清理已注册资源：
// 预览会话 → 回放会话 → SIP 引擎

pub mod coordinator;
pub mod resource;
pub mod signal;

pub use coordinator::{ShutdownCoordinator, ShutdownCoordinatorBuilder, ShutdownReport};
pub use resource::{Resource, ResourceError, ResourceManager};
pub use signal::{ShutdownSignal, SignalHandler};
