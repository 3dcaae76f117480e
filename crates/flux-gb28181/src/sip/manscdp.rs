// GB28181 MANSCDP XML
// 出站：Query / Control 报文；入站：CmdType 路由、Catalog 与 DeviceInfo 解析

use quick_xml::de::from_str;
use serde::Deserialize;

use crate::directory::{CatalogEntry, Codec, DeviceProfile};

pub const CONTENT_TYPE: &str = "Application/MANSCDP+xml";

const PROLOG: &str = "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n";

/// 取第一个同名标签的文本（标签名大小写不敏感），去除首尾空白，空值视为不存在
pub fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let lower = xml.to_ascii_lowercase();
    let tag = tag.to_ascii_lowercase();
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);

    let mut from = 0;
    while let Some(pos) = lower[from..].find(&open) {
        let start = from + pos;
        let after = start + open.len();
        // 排除 <DeviceIDList> 这类前缀相同的标签
        match lower.as_bytes().get(after) {
            Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {}
            _ => {
                from = after;
                continue;
            }
        }
        let content_start = start + lower[start..].find('>')? + 1;
        let content_end = content_start + lower[content_start..].find(&close)?;
        let value = xml[content_start..content_end].trim();
        return (!value.is_empty()).then(|| value.to_string());
    }
    None
}

/// 依次取出所有 <Item>…</Item> 的内容
pub fn item_blocks(xml: &str) -> Vec<&str> {
    let lower = xml.to_ascii_lowercase();
    let mut blocks = Vec::new();
    let mut from = 0;
    while let Some(pos) = lower[from..].find("<item>") {
        let start = from + pos + "<item>".len();
        let Some(len) = lower[start..].find("</item>") else {
            break;
        };
        blocks.push(&xml[start..start + len]);
        from = start + len + "</item>".len();
    }
    blocks
}

/// Query 报文
pub fn build_query(cmd_type: &str, sn: u64, device_id: &str, extra: &str) -> String {
    format!(
        "{PROLOG}<Query>\r\n<CmdType>{cmd_type}</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n{extra}</Query>\r\n"
    )
}

/// 录像查询附加字段
pub fn record_info_extra(start_time: &str, end_time: &str) -> String {
    format!(
        "<StartTime>{start_time}</StartTime>\r\n<EndTime>{end_time}</EndTime>\r\n<Secrecy>0</Secrecy>\r\n<Type>all</Type>\r\n"
    )
}

/// DeviceControl 报文（PTZ）
pub fn build_ptz_control(sn: u64, device_id: &str, ptz_cmd: &str) -> String {
    format!(
        "{PROLOG}<Control>\r\n<CmdType>DeviceControl</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n<PTZCmd>{ptz_cmd}</PTZCmd>\r\n</Control>\r\n"
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogResponse {
    #[serde(default)]
    device_list: Option<DeviceList>,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(rename = "Item", default)]
    items: Vec<CatalogItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogItem {
    #[serde(rename = "DeviceID")]
    device_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Catalog 应答解析；严格解析失败时退回逐个 <Item> 提取
pub fn parse_catalog(xml: &str) -> Vec<CatalogEntry> {
    match from_str::<CatalogResponse>(xml) {
        Ok(resp) => resp
            .device_list
            .map(|list| {
                list.items
                    .into_iter()
                    .map(|item| catalog_entry(item.device_id, item.name, item.status))
                    .collect()
            })
            .unwrap_or_default(),
        Err(e) => {
            tracing::debug!(target: "gb28181::sip", error = %e, "Catalog XML not well-formed, scanning items");
            item_blocks(xml)
                .into_iter()
                .filter_map(|block| {
                    let device_id = extract_tag(block, "DeviceID")?;
                    Some(catalog_entry(
                        device_id,
                        extract_tag(block, "Name"),
                        extract_tag(block, "Status"),
                    ))
                })
                .collect()
        }
    }
}

fn catalog_entry(channel_id: String, name: Option<String>, status: Option<String>) -> CatalogEntry {
    let name = name.map(|n| n.trim().to_string()).unwrap_or_default();
    CatalogEntry {
        codec: Codec::detect(&name),
        channel_id: channel_id.trim().to_string(),
        name,
        status,
    }
}

/// DeviceInfo 应答
pub fn parse_device_info(xml: &str) -> DeviceProfile {
    DeviceProfile {
        name: extract_tag(xml, "DeviceName").or_else(|| extract_tag(xml, "Name")),
        manufacturer: extract_tag(xml, "Manufacturer"),
        model: extract_tag(xml, "Model"),
        firmware: extract_tag(xml, "Firmware"),
    }
}
