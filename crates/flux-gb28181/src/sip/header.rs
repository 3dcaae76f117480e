// 地址头部解析
// 均为全函数：解析不出时返回 None，不依赖具体头部类型

use super::message::SipRequest;

/// `<sip:user@host:port>;tag=x` -> `user`
pub fn user_part(value: &str) -> Option<String> {
    let uri = uri_of(value)?;
    let rest = uri
        .strip_prefix("sip:")
        .or_else(|| uri.strip_prefix("sips:"))?;
    let (user, _) = rest.split_once('@')?;
    let user = user.split(':').next().unwrap_or_default().trim();
    (!user.is_empty()).then(|| user.to_string())
}

/// 取出尖括号内的 URI；无尖括号时取第一个参数前的部分
pub fn uri_of(value: &str) -> Option<&str> {
    let value = value.trim();
    let uri = match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.split(';').next().unwrap_or_default(),
    };
    let uri = uri.trim();
    (!uri.is_empty()).then_some(uri)
}

/// 头部参数，例如 tag / branch / received
pub fn param(value: &str, name: &str) -> Option<String> {
    // 尖括号内的 URI 参数不算头部参数
    let params = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value.split_once(';').map(|(_, p)| p).unwrap_or_default(),
    };
    params
        .split(';')
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn tag(value: &str) -> Option<String> {
    param(value, "tag")
}

/// `sip:user@host:port` -> (host, port)
pub fn host_port(uri: &str) -> Option<(String, u16)> {
    let rest = uri
        .strip_prefix("sip:")
        .or_else(|| uri.strip_prefix("sips:"))
        .unwrap_or(uri);
    let host_part = rest.rsplit_once('@').map(|(_, h)| h).unwrap_or(rest);
    let host_part = host_part.split(';').next().unwrap_or_default();
    match host_part.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None if !host_part.is_empty() => Some((host_part.to_string(), 5060)),
        None => None,
    }
}

/// 请求头中的设备 ID：先 From 后 To
pub fn device_id_from_headers(request: &SipRequest) -> Option<String> {
    request
        .header("From")
        .and_then(user_part)
        .or_else(|| request.header("To").and_then(user_part))
}

/// Expires 头部
pub fn expires(request: &SipRequest) -> Option<u32> {
    request.header("Expires")?.trim().parse().ok()
}
