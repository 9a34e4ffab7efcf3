// 该文件是 Tanjing （探镜） 项目的一部分。
// src/engine.rs - 回放推理引擎
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

//! 不依赖加速硬件的推理引擎，权重文件是一段 JSON 脚本：
//!
//! ```json
//! {
//!   "latency_ms": 40,
//!   "detections": [
//!     {"tag_name": "person", "probability": 0.9,
//!      "bounding_box": {"left": 0.1, "top": 0.1, "width": 0.3, "height": 0.6}}
//!   ],
//!   "fail_after": null
//! }
//! ```

use std::{
  fs,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  thread,
  time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
  catalog::{ModelDescriptor, WeightsLocator},
  frame::{AsNhwcFrame, PreparedFrame},
  inference::InferenceError,
  model::{Detection, InferenceEngine, LoadError, ModelLoader},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayScript {
  #[serde(default)]
  pub latency_ms: u64,
  #[serde(default)]
  pub detections: Vec<Detection>,
  /// 成功调用这么多次之后开始报错
  #[serde(default)]
  pub fail_after: Option<u64>,
}

/// 按脚本返回固定结果，并模拟推理延迟
#[derive(Debug)]
pub struct ReplayEngine {
  script: ReplayScript,
  calls: AtomicU64,
}

impl ReplayEngine {
  pub fn new(script: ReplayScript) -> Self {
    Self {
      script,
      calls: AtomicU64::new(0),
    }
  }

  pub fn calls(&self) -> u64 {
    self.calls.load(Ordering::SeqCst)
  }
}

impl InferenceEngine for ReplayEngine {
  fn predict(&self, input: &PreparedFrame) -> Result<Vec<Detection>, InferenceError> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if self.script.latency_ms > 0 {
      thread::sleep(Duration::from_millis(self.script.latency_ms));
    }
    if self.script.fail_after.is_some_and(|limit| call > limit) {
      return Err(InferenceError::Engine(format!(
        "第 {} 次调用超出脚本上限",
        call
      )));
    }
    debug!(
      "回放第 {} 次推理，输入 {}x{}，{} 字节",
      call,
      input.width(),
      input.height(),
      input.as_nhwc().len()
    );
    Ok(self.script.detections.clone())
  }
}

/// 从 JSON 脚本创建 [`ReplayEngine`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayLoader;

impl ReplayLoader {
  pub fn new() -> Self {
    Self
  }

  pub fn read_script(
    descriptor: &ModelDescriptor,
    weights: &WeightsLocator,
  ) -> Result<ReplayScript, LoadError> {
    let engine_error = |reason: String| LoadError::Engine {
      model: descriptor.id.clone(),
      reason,
    };
    let text = fs::read_to_string(weights.path()).map_err(|e| engine_error(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| engine_error(e.to_string()))
  }
}

impl ModelLoader for ReplayLoader {
  fn load(
    &self,
    descriptor: &ModelDescriptor,
    weights: &WeightsLocator,
  ) -> Result<Arc<dyn InferenceEngine>, LoadError> {
    let script = Self::read_script(descriptor, weights)?;
    info!(
      "回放引擎就绪: {}，延迟 {} ms，{} 个结果",
      descriptor.id,
      script.latency_ms,
      script.detections.len()
    );
    Ok(Arc::new(ReplayEngine::new(script)))
  }
}
