// 该文件是 Tanjing （探镜） 项目的一部分。
// src/inference.rs - 计时推理调用
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

use std::{
  cmp::Ordering,
  panic::{self, AssertUnwindSafe},
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error};

use crate::{
  frame::PreparedFrame,
  model::{ActiveModel, Detection},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
  #[error("推理引擎错误: {0}")]
  Engine(String),
  #[error("输入尺寸不匹配: 期望 {expected}, 实际 {actual}")]
  ShapeMismatch { expected: u32, actual: u32 },
  #[error("推理时内存不足: {0}")]
  OutOfMemory(String),
  #[error("推理引擎崩溃: {0}")]
  Panicked(String),
}

/// 一次推理的结果与耗时
#[derive(Debug, Clone)]
pub struct Inference {
  pub detections: Vec<Detection>,
  pub elapsed: Duration,
}

impl Inference {
  pub fn elapsed_ms(&self) -> f64 {
    self.elapsed.as_secs_f64() * 1000.0
  }

  /// 按单帧推理耗时折算的帧率，耗时为零时无定义
  pub fn fps(&self) -> Option<f64> {
    let ms = self.elapsed_ms();
    if ms > 0.0 { Some(1000.0 / ms) } else { None }
  }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InferenceInvoker;

impl InferenceInvoker {
  pub fn new() -> Self {
    Self
  }

  /// 在给定模型快照上执行一次推理
  ///
  /// 低于阈值或概率非有限的结果被丢弃，其余按概率降序、同概率按类别名升序排列。
  pub fn infer(
    &self,
    model: &ActiveModel,
    input: &PreparedFrame,
  ) -> Result<Inference, InferenceError> {
    if input.size() != model.input_size() {
      return Err(InferenceError::ShapeMismatch {
        expected: model.input_size(),
        actual: input.size(),
      });
    }

    let engine = model.engine();
    let now = Instant::now();
    let raw = panic::catch_unwind(AssertUnwindSafe(|| engine.predict(input)))
      .map_err(|payload| InferenceError::Panicked(panic_message(payload.as_ref())))
      .and_then(|result| result);
    let elapsed = now.elapsed();

    let raw = raw.map_err(|e| {
      error!("模型 {} 推理失败: {}", model.id(), e);
      e
    })?;

    let threshold = model.probability_threshold();
    let total = raw.len();
    let mut detections: Vec<Detection> = raw
      .into_iter()
      .filter(|d| d.probability.is_finite() && d.probability >= threshold)
      .map(|d| Detection {
        probability: d.probability.min(1.0),
        bounding_box: d.bounding_box.clamped(),
        tag_name: d.tag_name,
      })
      .collect();
    detections.sort_by(|a, b| {
      b.probability
        .partial_cmp(&a.probability)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.tag_name.cmp(&b.tag_name))
    });

    debug!(
      "推理完成，耗时: {:.2?}，保留 {}/{} 个结果",
      elapsed,
      detections.len(),
      total
    );

    Ok(Inference {
      detections,
      elapsed,
    })
  }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "未知错误".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    catalog::ModelDescriptor,
    frame::ChannelOrder,
    model::{BoundingBox, InferenceEngine, LabelSet},
  };
  use std::sync::Arc;

  struct Fixed(Vec<Detection>);

  impl InferenceEngine for Fixed {
    fn predict(&self, _input: &PreparedFrame) -> Result<Vec<Detection>, InferenceError> {
      Ok(self.0.clone())
    }
  }

  struct Sleepy(Duration);

  impl InferenceEngine for Sleepy {
    fn predict(&self, _input: &PreparedFrame) -> Result<Vec<Detection>, InferenceError> {
      std::thread::sleep(self.0);
      Ok(Vec::new())
    }
  }

  struct Exploding;

  impl InferenceEngine for Exploding {
    fn predict(&self, _input: &PreparedFrame) -> Result<Vec<Detection>, InferenceError> {
      panic!("tensor shape overflow");
    }
  }

  fn model(engine: impl InferenceEngine + 'static, threshold: f32) -> ActiveModel {
    let descriptor = ModelDescriptor {
      id: "test".into(),
      display_name: "Test".into(),
      labels: LabelSet::default(),
      built_in: true,
      file_name: "test.json".into(),
    };
    ActiveModel::new(
      descriptor,
      Arc::new(engine),
      LabelSet::default(),
      threshold,
      2,
      1,
    )
  }

  fn input() -> PreparedFrame {
    PreparedFrame::from_parts(2, ChannelOrder::Bgr, vec![0; 12])
  }

  fn det(tag: &str, p: f32) -> Detection {
    Detection::new(tag, p, BoundingBox::new(0.1, 0.1, 0.2, 0.2))
  }

  #[test]
  fn threshold_is_inclusive() {
    let m = model(
      Fixed(vec![det("a", 0.9), det("b", 0.55), det("c", 0.6)]),
      0.6,
    );
    let result = InferenceInvoker::new().infer(&m, &input()).unwrap();
    let kept: Vec<_> = result.detections.iter().map(|d| d.probability).collect();
    assert_eq!(kept, [0.9, 0.6]);
  }

  #[test]
  fn ties_break_by_tag_name() {
    let m = model(
      Fixed(vec![
        det("zebra", 0.8),
        det("cat", 0.95),
        det("apple", 0.8),
        det("nan", f32::NAN),
      ]),
      0.5,
    );
    let result = InferenceInvoker::new().infer(&m, &input()).unwrap();
    let tags: Vec<_> = result.detections.iter().map(|d| d.tag_name.as_str()).collect();
    assert_eq!(tags, ["cat", "apple", "zebra"]);
  }

  #[test]
  fn boxes_are_clamped() {
    let wide = Detection::new("a", 1.2, BoundingBox::new(0.8, -0.5, 0.5, 0.5));
    let m = model(Fixed(vec![wide]), 0.5);
    let result = InferenceInvoker::new().infer(&m, &input()).unwrap();
    let d = &result.detections[0];
    assert_eq!(d.probability, 1.0);
    assert_eq!(d.bounding_box.corners()[2], 1.0);
    assert_eq!(d.bounding_box.top, 0.0);
  }

  #[test]
  fn fps_from_latency() {
    let inference = Inference {
      detections: Vec::new(),
      elapsed: Duration::from_millis(50),
    };
    assert_eq!(inference.fps().map(f64::round), Some(20.0));

    let instant = Inference {
      detections: Vec::new(),
      elapsed: Duration::ZERO,
    };
    assert_eq!(instant.fps(), None);
  }

  #[test]
  fn elapsed_covers_engine_call() {
    let m = model(Sleepy(Duration::from_millis(20)), 0.5);
    let result = InferenceInvoker::new().infer(&m, &input()).unwrap();
    assert!(result.elapsed >= Duration::from_millis(20));
    assert!(result.fps().unwrap() <= 50.0);
  }

  #[test]
  fn panic_becomes_error() {
    let m = model(Exploding, 0.5);
    assert_eq!(
      InferenceInvoker::new().infer(&m, &input()).unwrap_err(),
      InferenceError::Panicked("tensor shape overflow".into())
    );
  }

  #[test]
  fn shape_mismatch() {
    let m = model(Fixed(Vec::new()), 0.5);
    let wrong = PreparedFrame::from_parts(1, ChannelOrder::Bgr, vec![0; 3]);
    assert_eq!(
      InferenceInvoker::new().infer(&m, &wrong).unwrap_err(),
      InferenceError::ShapeMismatch {
        expected: 2,
        actual: 1
      }
    );
  }
}
