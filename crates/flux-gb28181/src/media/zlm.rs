// ZLMediaKit HTTP API 客户端
// 所有接口均为 GET + 查询参数，应答为 {"code": 0, ...}

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::gateway::{MediaGateway, PlayUrls};
use crate::directory::Transport;
use crate::error::{Gb28181Error, Result};
use flux_config::MediaConfig;

/// 端口冲突后重试前的等待
const REOPEN_DELAY: Duration = Duration::from_millis(120);
const VHOST: &str = "__defaultVhost__";

pub struct ZlmClient {
    client: reqwest::Client,
    base: Url,
    public_base: String,
    secret: String,
    default_app: String,
}

impl ZlmClient {
    pub fn new(config: &MediaConfig) -> Result<Self> {
        let base = Url::parse(config.base_url.trim()).map_err(|e| {
            Gb28181Error::validation(format!("invalid media.base_url {}: {}", config.base_url, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()?;

        Ok(Self {
            client,
            base,
            public_base: config.public_base().to_string(),
            secret: config.secret.clone(),
            default_app: config.default_app.clone(),
        })
    }

    async fn call(&self, api: &str, params: &[(&str, &str)]) -> Result<ZlmReply> {
        let mut url = self.base.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}/index/api/{}", prefix, api));
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("secret", &self.secret);
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Gb28181Error::upstream(format!("ZLMediaKit {} request failed: {}", api, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Gb28181Error::upstream(format!(
                "ZLMediaKit {} HTTP {}",
                api, status
            )));
        }
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| Gb28181Error::upstream(format!("ZLMediaKit {} invalid reply: {}", api, e)))?;
        Ok(ZlmReply(body))
    }

    async fn request_open(&self, stream_id: &str, tcp_mode: &str, ssrc: Option<&str>) -> Result<ZlmReply> {
        let mut params = vec![("port", "0"), ("tcp_mode", tcp_mode), ("stream_id", stream_id)];
        if let Some(ssrc) = ssrc.map(str::trim).filter(|s| !s.is_empty()) {
            params.push(("ssrc", ssrc));
        }
        self.call("openRtpServer", &params).await
    }

    fn record_params<'a>(app: &'a str, stream_id: &'a str) -> Vec<(&'static str, &'a str)> {
        vec![("type", "1"), ("vhost", VHOST), ("app", app), ("stream", stream_id)]
    }
}

#[async_trait]
impl MediaGateway for ZlmClient {
    async fn open_rtp_server(
        &self,
        stream_id: &str,
        transport: Transport,
        ssrc: Option<&str>,
    ) -> Result<u16> {
        // tcp_mode: 0 UDP，1 TCP 被动
        let tcp_mode = match transport {
            Transport::Udp => "0",
            Transport::Tcp => "1",
        };

        let mut reply = self.request_open(stream_id, tcp_mode, ssrc).await?;
        if reply.already_exists() {
            tracing::warn!(
                target: "gb28181::zlm",
                %stream_id,
                "openRtpServer stream already exists, closing stale receiver"
            );
            if let Err(e) = self.close_rtp_server(stream_id).await {
                tracing::debug!(target: "gb28181::zlm", %stream_id, error = %e, "closeRtpServer before retry failed");
            }
            tokio::time::sleep(REOPEN_DELAY).await;
            reply = self.request_open(stream_id, tcp_mode, ssrc).await?;
        }

        if !reply.is_success() {
            tracing::warn!(target: "gb28181::zlm", %stream_id, response = %reply.0, "openRtpServer failed");
            return Err(Gb28181Error::upstream(format!(
                "ZLMediaKit openRtpServer failed: {}",
                reply.message()
            )));
        }

        let port = reply.port().ok_or_else(|| {
            Gb28181Error::upstream("ZLMediaKit openRtpServer returned no port")
        })?;
        tracing::debug!(target: "gb28181::zlm", %stream_id, port, tcp_mode, "RTP server opened");
        Ok(port)
    }

    async fn close_rtp_server(&self, stream_id: &str) -> Result<()> {
        let reply = self.call("closeRtpServer", &[("stream_id", stream_id)]).await?;
        if !reply.is_success() {
            tracing::debug!(target: "gb28181::zlm", %stream_id, msg = %reply.message(), "closeRtpServer not applied");
        }
        Ok(())
    }

    async fn is_stream_ready(&self, app: &str, stream_id: &str) -> Result<bool> {
        let reply = self
            .call("getMediaList", &[("app", app), ("stream", stream_id)])
            .await?;
        Ok(reply.is_success()
            && reply
                .0
                .get("data")
                .and_then(Value::as_array)
                .map_or(false, |list| !list.is_empty()))
    }

    async fn start_record(
        &self,
        app: &str,
        stream_id: &str,
        customized_path: Option<&str>,
    ) -> Result<()> {
        let mut params = Self::record_params(app, stream_id);
        if let Some(path) = customized_path.map(str::trim).filter(|p| !p.is_empty()) {
            params.push(("customized_path", path));
        }

        let reply = self.call("startRecord", &params).await?;
        if reply.is_success() || reply.message_contains(&["already recording", "recording already started"]) {
            tracing::info!(target: "gb28181::zlm", %app, %stream_id, "MP4 recording started");
            return Ok(());
        }
        Err(Gb28181Error::upstream(format!(
            "ZLMediaKit startRecord failed: {}",
            reply.message()
        )))
    }

    async fn stop_record(&self, app: &str, stream_id: &str) -> Result<()> {
        let reply = self
            .call("stopRecord", &Self::record_params(app, stream_id))
            .await?;
        if reply.is_success()
            || reply.message_contains(&["not recording", "can not find the stream", "stream not found"])
        {
            return Ok(());
        }
        Err(Gb28181Error::upstream(format!(
            "ZLMediaKit stopRecord failed: {}",
            reply.message()
        )))
    }

    async fn is_recording(&self, app: &str, stream_id: &str) -> Result<bool> {
        let reply = self
            .call("isRecording", &Self::record_params(app, stream_id))
            .await?;
        Ok(reply.is_success() && reply.flag("status"))
    }

    fn default_app(&self) -> &str {
        &self.default_app
    }

    fn play_urls(&self, app: &str, stream_id: &str) -> PlayUrls {
        PlayUrls::build(&self.public_base, app, stream_id)
    }
}

/// ZLMediaKit 应答
struct ZlmReply(Value);

impl ZlmReply {
    fn code(&self) -> Option<i64> {
        self.0.get("code").and_then(Value::as_i64)
    }

    fn is_success(&self) -> bool {
        self.code() == Some(0)
    }

    fn message(&self) -> String {
        ["msg", "message"]
            .iter()
            .filter_map(|key| self.0.get(*key).and_then(Value::as_str))
            .find(|msg| !msg.trim().is_empty())
            .unwrap_or("unknown")
            .to_string()
    }

    fn message_contains(&self, needles: &[&str]) -> bool {
        let msg = self.message().to_ascii_lowercase();
        needles.iter().any(|n| msg.contains(n))
    }

    fn already_exists(&self) -> bool {
        self.code() == Some(-300) && self.message_contains(&["already exists"])
    }

    /// port 或 data.port
    fn port(&self) -> Option<u16> {
        self.0
            .get("port")
            .or_else(|| self.0.get("data").and_then(|d| d.get("port")))
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0)
    }

    fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().map_or(false, |v| v != 0),
            Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct MockZlm {
        open_calls: AtomicUsize,
        close_calls: AtomicUsize,
    }

    async fn open_rtp(
        State(mock): State<Arc<MockZlm>>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        assert_eq!(params.get("secret").map(String::as_str), Some("123456"));
        let n = mock.open_calls.fetch_add(1, Ordering::SeqCst);
        match params.get("stream_id").map(String::as_str) {
            Some("busy") if n == 0 => Json(json!({"code": -300, "msg": "stream already exists"})),
            Some("busy") => Json(json!({"code": 0, "data": {"port": 30002}})),
            Some("broken") => Json(json!({"code": -1, "msg": "port exhausted"})),
            _ => Json(json!({"code": 0, "port": 30001})),
        }
    }

    async fn close_rtp(State(mock): State<Arc<MockZlm>>) -> Json<Value> {
        mock.close_calls.fetch_add(1, Ordering::SeqCst);
        Json(json!({"code": 0, "hit": 1}))
    }

    async fn media_list(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        if params.get("stream").map(String::as_str) == Some("live") {
            Json(json!({"code": 0, "data": [{"app": "rtp", "stream": "live"}]}))
        } else {
            Json(json!({"code": 0}))
        }
    }

    async fn start_mock() -> (ZlmClient, Arc<MockZlm>) {
        let mock = Arc::new(MockZlm::default());
        let app = Router::new()
            .route("/index/api/openRtpServer", get(open_rtp))
            .route("/index/api/closeRtpServer", get(close_rtp))
            .route("/index/api/getMediaList", get(media_list))
            .with_state(mock.clone());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service()));

        let config = MediaConfig {
            base_url: format!("http://{}", addr),
            ..MediaConfig::default()
        };
        (ZlmClient::new(&config).unwrap(), mock)
    }

    #[tokio::test]
    async fn test_open_rtp_server() {
        let (client, mock) = start_mock().await;
        let port = client
            .open_rtp_server("ch1", Transport::Udp, Some("0340200001"))
            .await
            .unwrap();
        assert_eq!(port, 30001);
        assert_eq!(mock.close_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_rtp_server_retries_after_conflict() {
        let (client, mock) = start_mock().await;
        let port = client.open_rtp_server("busy", Transport::Tcp, None).await.unwrap();
        assert_eq!(port, 30002);
        assert_eq!(mock.open_calls.load(Ordering::SeqCst), 2);
        assert_eq!(mock.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_rtp_server_failure_is_upstream() {
        let (client, _mock) = start_mock().await;
        let err = client
            .open_rtp_server("broken", Transport::Udp, None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 502);
        assert!(err.to_string().contains("port exhausted"));
    }

    #[tokio::test]
    async fn test_is_stream_ready() {
        let (client, _mock) = start_mock().await;
        assert!(client.is_stream_ready("rtp", "live").await.unwrap());
        assert!(!client.is_stream_ready("rtp", "idle").await.unwrap());
    }

    #[test]
    fn test_reply_helpers() {
        let reply = ZlmReply(json!({"code": -300, "message": "Stream Already Exists"}));
        assert!(reply.already_exists());
        assert_eq!(reply.port(), None);

        let reply = ZlmReply(json!({"code": 0, "status": 1}));
        assert!(reply.flag("status"));
        assert_eq!(reply.message(), "unknown");
    }
}
