// 该文件是 Tanjing （探镜） 项目的一部分。
// src/config.rs - 流水线配置
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::ChannelOrder};

pub const DEFAULT_INPUT_SIZE: u32 = 416;
pub const DEFAULT_PROBABILITY_THRESHOLD: f32 = 0.6;
const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 100;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("无效的参数 {key}: {value}")]
  InvalidParameter { key: String, value: String },
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("配置格式错误: {0}")]
  Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub input_size: u32,
  pub probability_threshold: f32,
  pub channel_order: ChannelOrder,
  /// 单次推理的超时，超时后由看门狗收回准入许可；`None` 时不启用看门狗
  pub inference_timeout_ms: Option<u64>,
  pub watchdog_interval_ms: u64,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      input_size: DEFAULT_INPUT_SIZE,
      probability_threshold: DEFAULT_PROBABILITY_THRESHOLD,
      channel_order: ChannelOrder::default(),
      inference_timeout_ms: None,
      watchdog_interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
    }
  }
}

impl PipelineConfig {
  pub fn with_input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn with_threshold(mut self, threshold: f32) -> Self {
    self.probability_threshold = threshold;
    self
  }

  pub fn with_channel_order(mut self, order: ChannelOrder) -> Self {
    self.channel_order = order;
    self
  }

  /// 不足一毫秒的超时向上取整
  pub fn with_inference_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.inference_timeout_ms = timeout.map(|t| t.as_micros().div_ceil(1000) as u64);
    self
  }

  pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
    self.watchdog_interval_ms = interval.as_millis() as u64;
    self
  }

  pub fn inference_timeout(&self) -> Option<Duration> {
    self.inference_timeout_ms.map(Duration::from_millis)
  }

  pub fn watchdog_interval(&self) -> Duration {
    Duration::from_millis(self.watchdog_interval_ms.max(1))
  }

  /// 从 JSON 文件读取，缺省字段取默认值
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
  }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
  value.parse().map_err(|_| ConfigError::InvalidParameter {
    key: key.to_string(),
    value: value.to_string(),
  })
}

impl FromUrlWithScheme for PipelineConfig {
  const SCHEME: &'static str = "pipeline";
}

impl FromUrl for PipelineConfig {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ConfigError::SchemeMismatch);
    }

    let mut config = PipelineConfig::default();
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "input_size" => config.input_size = parse(&key, &value)?,
        "threshold" => config.probability_threshold = parse(&key, &value)?,
        "order" => {
          config.channel_order = match value.as_ref() {
            "bgr" => ChannelOrder::Bgr,
            "rgb" => ChannelOrder::Rgb,
            _ => {
              return Err(ConfigError::InvalidParameter {
                key: key.to_string(),
                value: value.to_string(),
              });
            }
          }
        }
        "timeout_ms" => config.inference_timeout_ms = Some(parse(&key, &value)?),
        "watchdog_ms" => config.watchdog_interval_ms = parse(&key, &value)?,
        _ => {}
      }
    }

    Ok(config)
  }
}
