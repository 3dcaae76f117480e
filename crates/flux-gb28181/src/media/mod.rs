// 流媒体网关客户端

pub mod gateway;
pub mod zlm;

pub use gateway::{MediaGateway, MediaGatewayRef, PlayUrls};
pub use zlm::ZlmClient;
