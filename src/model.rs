// 该文件是 Tanjing （探镜） 项目的一部分。
// src/model.rs - 模型
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

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  catalog::{CatalogError, ModelDescriptor, WeightsLocator},
  frame::PreparedFrame,
  inference::InferenceError,
};

mod slot;
pub use self::slot::{ModelSlot, SelectionGuard};

/// 推理引擎，接受固定尺寸的输入，返回检测结果
///
/// 实现需要是线程安全的：推理在工作线程上执行，而模型切换发生在调用者线程上。
pub trait InferenceEngine: Send + Sync {
  fn predict(&self, input: &PreparedFrame) -> Result<Vec<Detection>, InferenceError>;
}

/// 根据模型描述和权重位置创建推理引擎
pub trait ModelLoader: Send + Sync {
  fn load(
    &self,
    descriptor: &ModelDescriptor,
    weights: &WeightsLocator,
  ) -> Result<Arc<dyn InferenceEngine>, LoadError>;
}

#[derive(Error, Debug)]
pub enum LoadError {
  #[error("模型目录错误: {0}")]
  Catalog(#[from] CatalogError),
  #[error("模型 {model} 加载失败: {reason}")]
  Engine { model: String, reason: String },
  #[error("无效的置信度阈值: {0}")]
  InvalidThreshold(f32),
  #[error("无效的模型输入尺寸: {0}")]
  InvalidInputSize(u32),
}

/// 归一化的边界框，各分量都在 [0, 1] 内
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
  pub left: f32,
  pub top: f32,
  pub width: f32,
  pub height: f32,
}

impl BoundingBox {
  pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
    Self {
      left,
      top,
      width,
      height,
    }
  }

  /// 裁剪到帧范围内
  pub fn clamped(&self) -> Self {
    let left = unit(self.left);
    let top = unit(self.top);
    Self {
      left,
      top,
      width: unit(self.width).min(1.0 - left),
      height: unit(self.height).min(1.0 - top),
    }
  }

  /// [x_min, y_min, x_max, y_max]
  pub fn corners(&self) -> [f32; 4] {
    [
      self.left,
      self.top,
      self.left + self.width,
      self.top + self.height,
    ]
  }
}

fn unit(v: f32) -> f32 {
  if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub tag_name: String,
  pub probability: f32,
  pub bounding_box: BoundingBox,
}

impl Detection {
  pub fn new(tag_name: impl Into<String>, probability: f32, bounding_box: BoundingBox) -> Self {
    Self {
      tag_name: tag_name.into(),
      probability,
      bounding_box,
    }
  }
}

/// 模型支持的类别，升序且去重
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct LabelSet {
  labels: Vec<String>,
}

const SUMMARY_HEAD: usize = 2;

impl LabelSet {
  pub fn new<I, S>(labels: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut labels: Vec<String> = labels.into_iter().map(Into::into).collect();
    labels.sort();
    labels.dedup();
    Self { labels }
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.labels.iter().map(String::as_str)
  }

  /// 界面上展示的类别摘要，超过两个时只列出前两个
  pub fn summary(&self) -> String {
    let head = self
      .labels
      .iter()
      .take(SUMMARY_HEAD)
      .map(String::as_str)
      .collect::<Vec<_>>()
      .join(", ");
    if self.labels.len() > SUMMARY_HEAD {
      format!(
        "支持的类别: {} 及其他 {} 个",
        head,
        self.labels.len() - SUMMARY_HEAD
      )
    } else {
      format!("支持的类别: {}", head)
    }
  }
}

impl From<Vec<String>> for LabelSet {
  fn from(labels: Vec<String>) -> Self {
    LabelSet::new(labels)
  }
}

impl From<LabelSet> for Vec<String> {
  fn from(set: LabelSet) -> Self {
    set.labels
  }
}

/// 当前生效的模型
///
/// 发布后除就绪标志外不可变。推理持有自己的快照，切换模型不会影响进行中的推理，
/// 旧引擎在最后一个使用者释放后才被销毁。
pub struct ActiveModel {
  descriptor: ModelDescriptor,
  engine: Arc<dyn InferenceEngine>,
  labels: LabelSet,
  probability_threshold: f32,
  input_size: u32,
  generation: u64,
  ready: AtomicBool,
}

impl std::fmt::Debug for ActiveModel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ActiveModel")
      .field("id", &self.descriptor.id)
      .field("labels", &self.labels.len())
      .field("probability_threshold", &self.probability_threshold)
      .field("input_size", &self.input_size)
      .field("generation", &self.generation)
      .field("ready", &self.is_ready())
      .finish()
  }
}

impl ActiveModel {
  pub(crate) fn new(
    descriptor: ModelDescriptor,
    engine: Arc<dyn InferenceEngine>,
    labels: LabelSet,
    probability_threshold: f32,
    input_size: u32,
    generation: u64,
  ) -> Self {
    Self {
      descriptor,
      engine,
      labels,
      probability_threshold,
      input_size,
      generation,
      ready: AtomicBool::new(true),
    }
  }

  pub fn descriptor(&self) -> &ModelDescriptor {
    &self.descriptor
  }

  pub fn id(&self) -> &str {
    &self.descriptor.id
  }

  pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
    &self.engine
  }

  pub fn labels(&self) -> &LabelSet {
    &self.labels
  }

  pub fn probability_threshold(&self) -> f32 {
    self.probability_threshold
  }

  pub fn input_size(&self) -> u32 {
    self.input_size
  }

  /// 每次成功加载递增
  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn is_ready(&self) -> bool {
    self.ready.load(Ordering::Acquire)
  }

  /// 标记为不可用，仅在本次调用使其从就绪变为不可用时返回 `true`
  pub fn mark_unready(&self) -> bool {
    self.ready.swap(false, Ordering::AcqRel)
  }
}
