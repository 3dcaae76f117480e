// SIP 消息解析和生成
// 头部保持原始顺序，按名称大小写不敏感查找，兼容紧凑写法（i / f / t / v / m / l / c）

use std::fmt;
use thiserror::Error;

/// SIP 方法
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Options,
    Info,
    Other(String),
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Other(name) => name,
        };
        f.write_str(name)
    }
}

impl SipMethod {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "MESSAGE" => SipMethod::Message,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            other => SipMethod::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SipParseError {
    #[error("Empty SIP message")]
    Empty,

    #[error("Invalid start line: {0}")]
    InvalidStartLine(String),

    #[error("Invalid status code: {0}")]
    InvalidStatus(String),

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("SIP frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// 紧凑头部名展开
fn canonical_name(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        _ => name,
    }
}

/// 有序头部表
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 替换同名头部（不存在则追加）
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.push(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn write_to(&self, f: &mut fmt::Formatter<'_>, body: &str) -> fmt::Result {
        for (name, value) in &self.0 {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            write!(f, "{}: {}\r\n", name, value)?;
        }
        write!(f, "Content-Length: {}\r\n\r\n{}", body.len(), body)
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub headers: Headers,
    pub body: String,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::default(),
            body: String::new(),
        }
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(name, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// 设置消息体及 Content-Type
    pub fn set_body(&mut self, content_type: &str, body: impl Into<String>) {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        self.header("CSeq").and_then(parse_cseq)
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// 从字符串解析 SIP 请求
    pub fn parse(s: &str) -> Result<Self, SipParseError> {
        let (start, headers, body) = split_message(s)?;

        let parts: Vec<&str> = start.split_whitespace().collect();
        if parts.len() != 3 || !parts[2].starts_with("SIP/") {
            return Err(SipParseError::InvalidStartLine(start.to_string()));
        }

        Ok(Self {
            method: SipMethod::parse(parts[0]),
            uri: parts[1].to_string(),
            headers,
            body,
        })
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0\r\n", self.method, self.uri)?;
        self.headers.write_to(f, &self.body)
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

impl SipResponse {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            status_code,
            reason: reason.into(),
            headers: Headers::default(),
            body: String::new(),
        }
    }

    /// 按请求生成应答，复制 Via / From / To / Call-ID / CSeq
    pub fn for_request(request: &SipRequest, status_code: u16, reason: &str) -> Self {
        let mut response = Self::new(status_code, reason);
        for (name, value) in request.headers.iter() {
            let canonical = canonical_name(name);
            if ["Via", "From", "To", "Call-ID", "CSeq"]
                .iter()
                .any(|h| h.eq_ignore_ascii_case(canonical))
            {
                response.headers.push(canonical.to_string(), value.to_string());
            }
        }
        response
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(name, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        self.header("CSeq").and_then(parse_cseq)
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// 从字符串解析 SIP 响应
    pub fn parse(s: &str) -> Result<Self, SipParseError> {
        let (start, headers, body) = split_message(s)?;

        let parts: Vec<&str> = start.splitn(3, ' ').collect();
        if parts.len() < 2 || !parts[0].starts_with("SIP/") {
            return Err(SipParseError::InvalidStartLine(start.to_string()));
        }
        let status_code = parts[1]
            .parse::<u16>()
            .map_err(|_| SipParseError::InvalidStatus(parts[1].to_string()))?;

        Ok(Self {
            status_code,
            reason: parts.get(2).map(|r| r.trim().to_string()).unwrap_or_default(),
            headers,
            body,
        })
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}\r\n", self.status_code, self.reason)?;
        self.headers.write_to(f, &self.body)
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(s: &str) -> Result<Self, SipParseError> {
        let trimmed = s.trim_start_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Err(SipParseError::Empty);
        }
        if trimmed.starts_with("SIP/") {
            Ok(SipMessage::Response(SipResponse::parse(trimmed)?))
        } else {
            Ok(SipMessage::Request(SipRequest::parse(trimmed)?))
        }
    }
}

/// "CSeq: 20 INVITE" -> (20, Invite)
pub fn parse_cseq(value: &str) -> Option<(u32, SipMethod)> {
    let mut parts = value.split_whitespace();
    let seq = parts.next()?.parse().ok()?;
    let method = SipMethod::parse(parts.next()?);
    Some((seq, method))
}

/// 拆分起始行、头部和消息体；消息体按 Content-Length 截断
fn split_message(s: &str) -> Result<(&str, Headers, String), SipParseError> {
    let (head, rest) = match s.find("\r\n\r\n") {
        Some(pos) => (&s[..pos], &s[pos + 4..]),
        None => (s.trim_end_matches(['\r', '\n']), ""),
    };

    let mut lines = head.split("\r\n");
    let start = lines.next().map(str::trim).unwrap_or_default();
    if start.is_empty() {
        return Err(SipParseError::Empty);
    }

    let mut headers = Headers::default();
    for line in lines {
        // 折行续写
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.0.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push(canonical_name(name.trim()).to_string(), value.trim().to_string());
        }
    }

    let body = match headers
        .get("Content-Length")
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        Some(len) if len < rest.len() => {
            String::from_utf8_lossy(&rest.as_bytes()[..len]).into_owned()
        }
        _ => rest.to_string(),
    };

    Ok((start, headers, body))
}

/// 单条 SIP 消息（头部 + 消息体）的上限
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// TCP 流分帧：返回首个完整消息的字节长度，数据不足时返回 Ok(None)。
/// 超过 MAX_FRAME_LEN 的消息返回错误，调用方应断开连接
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, SipParseError> {
    let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4) else {
        if buf.len() > MAX_FRAME_LEN {
            return Err(SipParseError::FrameTooLarge(buf.len()));
        }
        return Ok(None);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]);

    let content_length = head
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| {
            let name = name.trim();
            name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l")
        })
        .map(|(_, value)| {
            let value = value.trim();
            value
                .parse::<usize>()
                .map_err(|_| SipParseError::InvalidContentLength(value.to_string()))
        })
        .transpose()?
        .unwrap_or(0);

    let total = head_end
        .checked_add(content_length)
        .filter(|total| *total <= MAX_FRAME_LEN)
        .ok_or(SipParseError::FrameTooLarge(content_length))?;
    Ok((buf.len() >= total).then_some(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_generation() {
        let mut req = SipRequest::new(
            SipMethod::Message,
            "sip:34020000001320000001@192.168.1.64:5060",
        );
        req.add_header("Via", "SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK1");
        req.add_header("Call-ID", "abc@192.168.1.100");
        req.add_header("CSeq", "7 MESSAGE");
        req.set_body("Application/MANSCDP+xml", "<Query/>");

        let sip_str = req.encode();
        assert!(sip_str.starts_with("MESSAGE sip:34020000001320000001@192.168.1.64:5060 SIP/2.0\r\n"));
        assert!(sip_str.contains("Content-Type: Application/MANSCDP+xml\r\n"));
        assert!(sip_str.ends_with("Content-Length: 8\r\n\r\n<Query/>"));
    }

    #[test]
    fn test_request_parsing_compact_headers() {
        let sip_str = "REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
v: SIP/2.0/UDP 192.168.1.64:5060;rport;branch=z9hG4bK1\r\n\
f: <sip:34020000001320000001@3402000000>;tag=abc\r\n\
t: <sip:34020000001320000001@3402000000>\r\n\
i: reg-1@192.168.1.64\r\n\
CSeq: 1 REGISTER\r\n\
Expires: 3600\r\n\
l: 0\r\n\r\n";

        let req = SipRequest::parse(sip_str).unwrap();
        assert_eq!(req.method, SipMethod::Register);
        assert_eq!(req.call_id(), Some("reg-1@192.168.1.64"));
        assert_eq!(req.header("from"), Some("<sip:34020000001320000001@3402000000>;tag=abc"));
        assert_eq!(req.cseq(), Some((1, SipMethod::Register)));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_response_parsing_with_body() {
        let body = "v=0\r\ny=0100000001\r\n";
        let sip_str = format!(
            "SIP/2.0 200 OK\r\nCall-ID: x@y\r\nCSeq: 20 INVITE\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );

        match SipMessage::parse(&sip_str).unwrap() {
            SipMessage::Response(resp) => {
                assert_eq!(resp.status_code, 200);
                assert_eq!(resp.reason, "OK");
                assert_eq!(resp.cseq(), Some((20, SipMethod::Invite)));
                assert_eq!(resp.body, body);
            }
            SipMessage::Request(_) => panic!("expected response"),
        }
    }

    #[test]
    fn test_unknown_method_is_preserved() {
        let req = SipRequest::parse("PUBLISH sip:a@b SIP/2.0\r\nCall-ID: 1\r\n\r\n").unwrap();
        assert_eq!(req.method, SipMethod::Other("PUBLISH".to_string()));
    }

    #[test]
    fn test_invalid_messages() {
        assert_eq!(SipMessage::parse("\r\n\r\n").unwrap_err(), SipParseError::Empty);
        assert!(SipResponse::parse("SIP/2.0 abc OK\r\n\r\n").is_err());
        assert!(SipRequest::parse("garbage\r\n\r\n").is_err());
    }

    #[test]
    fn test_response_for_request_copies_dialog_headers() {
        let req = SipRequest::parse(
            "BYE sip:a@b SIP/2.0\r\nVia: v1\r\nVia: v2\r\nFrom: f\r\nTo: t\r\nCall-ID: c\r\nCSeq: 3 BYE\r\nUser-Agent: cam\r\n\r\n",
        )
        .unwrap();
        let resp = SipResponse::for_request(&req, 200, "OK");
        assert_eq!(resp.headers.get_all("Via").count(), 2);
        assert_eq!(resp.header("CSeq"), Some("3 BYE"));
        assert!(resp.header("User-Agent").is_none());
    }

    #[test]
    fn test_frame_len() {
        let msg = b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 5\r\n\r\nhello";
        let mut buf = msg.to_vec();
        assert_eq!(frame_len(&buf), Ok(Some(msg.len())));

        buf.extend_from_slice(b"SIP/2.0 200");
        assert_eq!(frame_len(&buf), Ok(Some(msg.len())));
        assert_eq!(frame_len(&msg[..msg.len() - 2]), Ok(None));
    }

    #[test]
    fn test_frame_len_rejects_oversized_content_length() {
        let huge = b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 18446744073709551615\r\n\r\nx";
        assert!(matches!(frame_len(huge), Err(SipParseError::FrameTooLarge(_))));

        let over_cap = format!(
            "MESSAGE sip:a@b SIP/2.0\r\nContent-Length: {}\r\n\r\n",
            MAX_FRAME_LEN
        );
        assert!(frame_len(over_cap.as_bytes()).is_err());

        let garbage = b"MESSAGE sip:a@b SIP/2.0\r\nl: abc\r\n\r\n";
        assert_eq!(
            frame_len(garbage),
            Err(SipParseError::InvalidContentLength("abc".to_string()))
        );
    }

    #[test]
    fn test_frame_len_rejects_unterminated_head_over_cap() {
        let buf = vec![b'a'; MAX_FRAME_LEN + 1];
        assert_eq!(frame_len(&buf), Err(SipParseError::FrameTooLarge(MAX_FRAME_LEN + 1)));
        assert_eq!(frame_len(&buf[..1024]), Ok(None));
    }

    #[test]
    fn test_header_lookup_outlives_name() {
        let resp = SipResponse::parse("SIP/2.0 200 OK\r\nCall-ID: x@y\r\n\r\n").unwrap();
        let value = {
            let name = String::from("call-id");
            resp.headers.get(&name)
        };
        assert_eq!(value, Some("x@y"));
    }
}
