// SSRC 生成
// 前缀(1 位) + 域编码第 4~8 位(5 位) + 流水号(4 位，1..=9999 循环)

use std::sync::atomic::{AtomicU32, Ordering};

/// 回放流使用的前缀
pub const PLAYBACK_PREFIX: char = '1';

pub struct SsrcGenerator {
    prefix: char,
    domain_part: String,
    seq: AtomicU32,
}

impl SsrcGenerator {
    pub fn new(prefix: &str, domain: &str) -> Self {
        let prefix = prefix
            .chars()
            .next()
            .filter(|c| c.is_ascii_digit())
            .unwrap_or('0');
        let mut domain_part: String = domain.chars().skip(3).take(5).collect();
        while domain_part.len() < 5 {
            domain_part.push('0');
        }
        Self {
            prefix,
            domain_part,
            seq: AtomicU32::new(0),
        }
    }

    /// 实时流 SSRC
    pub fn next(&self) -> String {
        self.next_with_prefix(self.prefix)
    }

    /// 回放流 SSRC
    pub fn next_playback(&self) -> String {
        self.next_with_prefix(PLAYBACK_PREFIX)
    }

    fn next_with_prefix(&self, prefix: char) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 9999 + 1;
        format!("{}{}{:04}", prefix, self.domain_part, seq)
    }
}
