use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::directory::Transport;
use crate::error::Result;

/// 流媒体网关（RTP 接收端与录制控制）
#[async_trait]
pub trait MediaGateway: Send + Sync {
    /// 打开 RTP 接收端，返回分配的端口
    async fn open_rtp_server(
        &self,
        stream_id: &str,
        transport: Transport,
        ssrc: Option<&str>,
    ) -> Result<u16>;

    async fn close_rtp_server(&self, stream_id: &str) -> Result<()>;

    async fn is_stream_ready(&self, app: &str, stream_id: &str) -> Result<bool>;

    async fn start_record(
        &self,
        app: &str,
        stream_id: &str,
        customized_path: Option<&str>,
    ) -> Result<()>;

    async fn stop_record(&self, app: &str, stream_id: &str) -> Result<()>;

    async fn is_recording(&self, app: &str, stream_id: &str) -> Result<bool>;

    /// RTP 推流所在的应用名
    fn default_app(&self) -> &str;

    fn play_urls(&self, app: &str, stream_id: &str) -> PlayUrls;
}

pub type MediaGatewayRef = Arc<dyn MediaGateway>;

/// 对外播放地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayUrls {
    pub webrtc: String,
    pub hls: String,
    pub http_flv: String,
    pub rtsp: String,
    pub rtmp: String,
}

impl PlayUrls {
    pub fn build(public_base: &str, app: &str, stream_id: &str) -> Self {
        let base = public_base.trim().trim_end_matches('/');
        let host = base
            .strip_prefix("http://")
            .or_else(|| base.strip_prefix("https://"))
            .unwrap_or(base);

        Self {
            webrtc: format!("{}/index/api/webrtc?app={}&stream={}&type=play", base, app, stream_id),
            hls: format!("{}/{}/{}/hls.m3u8", base, app, stream_id),
            http_flv: format!("{}/{}/{}.live.flv", base, app, stream_id),
            rtsp: format!("rtsp://{}/{}/{}", host, app, stream_id),
            rtmp: format!("rtmp://{}/{}/{}", host, app, stream_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_urls() {
        let urls = PlayUrls::build("http://10.0.0.5:8081/", "rtp", "ch34020000001310000001");
        assert_eq!(
            urls.webrtc,
            "http://10.0.0.5:8081/index/api/webrtc?app=rtp&stream=ch34020000001310000001&type=play"
        );
        assert_eq!(urls.hls, "http://10.0.0.5:8081/rtp/ch34020000001310000001/hls.m3u8");
        assert_eq!(urls.http_flv, "http://10.0.0.5:8081/rtp/ch34020000001310000001.live.flv");
        assert_eq!(urls.rtsp, "rtsp://10.0.0.5:8081/rtp/ch34020000001310000001");
        assert_eq!(urls.rtmp, "rtmp://10.0.0.5:8081/rtp/ch34020000001310000001");
    }

    #[test]
    fn test_play_urls_https_base() {
        let urls = PlayUrls::build("https://media.example.com", "live", "s1");
        assert_eq!(urls.rtsp, "rtsp://media.example.com/live/s1");
        assert_eq!(urls.hls, "https://media.example.com/live/s1/hls.m3u8");
    }
}
