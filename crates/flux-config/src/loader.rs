use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

use crate::GlobalConfig;

/// 环境变量覆盖前缀，例如 FLUX_GB28181__SIP__LOCAL_PORT=15060
pub const ENV_PREFIX: &str = "FLUX_GB28181";

/// 配置加载器
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }

    /// 加载全局配置
    pub fn load_global(&self) -> Result<GlobalConfig> {
        let config_path = self.config_dir.join("global.toml");

        let mut builder = Config::builder();
        if config_path.exists() {
            builder = builder.add_source(File::new(
                config_path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// 加载并校验
    pub fn load(&self) -> Result<GlobalConfig> {
        let global = self.load_global()?;
        Self::validate(&global)?;
        Ok(global)
    }

    /// 验证配置
    pub fn validate(global: &GlobalConfig) -> Result<()> {
        let sip = &global.sip;

        if sip.server_id.len() != 20 || !sip.server_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(anyhow!(
                "sip.server_id must be 20 digits, got {:?}",
                sip.server_id
            ));
        }

        if sip.domain.len() < 5 {
            return Err(anyhow!("sip.domain too short: {:?}", sip.domain));
        }

        let prefix = sip.ssrc_prefix.as_bytes();
        if prefix.len() != 1 || !prefix[0].is_ascii_digit() {
            return Err(anyhow!(
                "sip.ssrc_prefix must be a single digit, got {:?}",
                sip.ssrc_prefix
            ));
        }

        if sip.invite_timeout_ms == 0 {
            return Err(anyhow!("sip.invite_timeout_ms must be greater than 0"));
        }

        if global.recording.reconcile_interval_ms == 0 {
            return Err(anyhow!("recording.reconcile_interval_ms must be greater than 0"));
        }

        if global.media.base_url.trim().is_empty() {
            return Err(anyhow!("media.base_url must not be empty"));
        }

        for device in &global.devices {
            if device.device_id.trim().is_empty() {
                return Err(anyhow!("devices[].device_id must not be empty"));
            }
        }

        Ok(())
    }
}
