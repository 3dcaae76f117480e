// GB28181 SIP 信令层
// 实现国标 GB/T 28181-2016 中平台侧的注册、保活、目录、点播与回放信令

pub mod engine;
pub mod header;
pub mod manscdp;
pub mod mansrtsp;
pub mod message;
pub mod ptz;
pub mod sdp;
pub mod ssrc;
pub mod transaction;
pub mod transport;

pub use engine::{InviteCommand, Signaling, SignalingEngine, SignalingRef};
pub use mansrtsp::PlaybackControl;
pub use message::{SipMessage, SipMethod, SipRequest, SipResponse};
pub use ptz::{PtzAction, PtzCommand};
pub use sdp::{PlaybackRange, SdpAnswer, SdpOffer};
pub use ssrc::SsrcGenerator;
pub use transaction::{DialogState, DialogView, Endpoint, SipEvent, SipOutcome};
pub use transport::SipTransport;
