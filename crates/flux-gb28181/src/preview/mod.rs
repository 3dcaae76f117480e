// 实时预览会话

pub mod orchestrator;
pub mod session;

pub use orchestrator::{PreviewOrchestrator, StartPreview};
pub use session::{ChannelRuntime, PreviewProtocol, SessionStatus, SessionView, StopOutcome};
