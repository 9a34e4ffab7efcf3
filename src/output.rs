// 该文件是 Tanjing （探镜） 项目的一部分。
// src/output.rs - 结果输出
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

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, model::Detection};

#[cfg(feature = "directory_record")]
mod record;
#[cfg(feature = "directory_record")]
pub use self::record::{RecordVisualizer, RecordVisualizerError};

/// 一帧的发布结果
#[derive(Debug, Clone, PartialEq)]
pub struct FrameResult {
  /// 准入序号，按准入顺序递增
  pub sequence: u64,
  pub model_id: String,
  pub detections: Vec<Detection>,
  pub elapsed: Duration,
  pub fps: Option<f64>,
  pub source_width: u32,
  pub source_height: u32,
}

impl FrameResult {
  /// 形如 "20 fps"，帧率无定义时为空
  pub fn fps_label(&self) -> String {
    self
      .fps
      .map(|fps| format!("{} fps", fps.round() as u64))
      .unwrap_or_default()
  }
}

/// 交给界面线程的消息
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
  Frame(FrameResult),
  Failure { model_id: String, message: String },
}

/// 界面协作方，只在运行 [`UiLoop`] 的线程上被调用
pub trait Visualizer {
  type Error;
  fn show(&mut self, result: &FrameResult) -> Result<(), Self::Error>;
  fn notify_failure(&mut self, model_id: &str, message: &str) -> Result<(), Self::Error>;
}

impl<V: Visualizer + ?Sized> Visualizer for Box<V> {
  type Error = V::Error;

  fn show(&mut self, result: &FrameResult) -> Result<(), Self::Error> {
    (**self).show(result)
  }

  fn notify_failure(&mut self, model_id: &str, message: &str) -> Result<(), Self::Error> {
    (**self).notify_failure(model_id, message)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiStep {
  Handled,
  Idle,
  Closed,
}

/// 界面消息循环
///
/// 流水线从工作线程发出 [`UiEvent`]，由持有本循环的线程依次交给 [`Visualizer`]。
pub struct UiLoop<V> {
  events: Receiver<UiEvent>,
  visualizer: V,
  shown: u64,
  failures: u64,
}

impl<V: Visualizer> UiLoop<V> {
  pub fn new(events: Receiver<UiEvent>, visualizer: V) -> Self {
    Self {
      events,
      visualizer,
      shown: 0,
      failures: 0,
    }
  }

  pub fn shown(&self) -> u64 {
    self.shown
  }

  pub fn failures(&self) -> u64 {
    self.failures
  }

  pub fn visualizer(&self) -> &V {
    &self.visualizer
  }

  pub fn into_inner(self) -> V {
    self.visualizer
  }

  fn dispatch(&mut self, event: UiEvent) -> Result<(), V::Error> {
    match event {
      UiEvent::Frame(result) => {
        self.shown += 1;
        self.visualizer.show(&result)
      }
      UiEvent::Failure { model_id, message } => {
        self.failures += 1;
        self.visualizer.notify_failure(&model_id, &message)
      }
    }
  }

  /// 处理所有已到达的消息，不阻塞
  pub fn pump(&mut self) -> Result<usize, V::Error> {
    let mut handled = 0;
    loop {
      match self.events.try_recv() {
        Ok(event) => {
          self.dispatch(event)?;
          handled += 1;
        }
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(handled),
      }
    }
  }

  /// 最多等待 `timeout` 处理一条消息
  pub fn step(&mut self, timeout: Duration) -> Result<UiStep, V::Error> {
    match self.events.recv_timeout(timeout) {
      Ok(event) => {
        self.dispatch(event)?;
        Ok(UiStep::Handled)
      }
      Err(RecvTimeoutError::Timeout) => Ok(UiStep::Idle),
      Err(RecvTimeoutError::Disconnected) => Ok(UiStep::Closed),
    }
  }

  /// 处理消息直到发送端全部关闭
  pub fn run(&mut self) -> Result<(), V::Error> {
    while let Ok(event) = self.events.recv() {
      self.dispatch(event)?;
    }
    Ok(())
  }
}

/// 把结果写入日志
#[derive(Debug, Default)]
pub struct LogVisualizer;

impl FromUrlWithScheme for LogVisualizer {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogVisualizer {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch);
    }
    Ok(LogVisualizer)
  }
}

impl Visualizer for LogVisualizer {
  type Error = std::convert::Infallible;

  fn show(&mut self, result: &FrameResult) -> Result<(), Self::Error> {
    let tags = result
      .detections
      .iter()
      .map(|d| format!("{}({:.2})", d.tag_name, d.probability))
      .collect::<Vec<_>>()
      .join(", ");
    info!(
      "第 {} 帧 [{}] {:.2?} {}: {}",
      result.sequence,
      result.model_id,
      result.elapsed,
      result.fps_label(),
      tags
    );
    Ok(())
  }

  fn notify_failure(&mut self, model_id: &str, message: &str) -> Result<(), Self::Error> {
    warn!("模型 {} 出错，已停止推理: {}", model_id, message);
    Ok(())
  }
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  RecordVisualizerError(#[from] RecordVisualizerError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum OutputWrapper {
  Log(LogVisualizer),
  #[cfg(feature = "directory_record")]
  Record(RecordVisualizer),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      LogVisualizer::SCHEME => Ok(OutputWrapper::Log(LogVisualizer::from_url(url)?)),
      #[cfg(feature = "directory_record")]
      RecordVisualizer::SCHEME => Ok(OutputWrapper::Record(RecordVisualizer::from_url(url)?)),
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl Visualizer for OutputWrapper {
  type Error = OutputError;

  fn show(&mut self, result: &FrameResult) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Log(output) => output.show(result).map_err(|never| match never {}),
      #[cfg(feature = "directory_record")]
      OutputWrapper::Record(output) => output.show(result).map_err(OutputError::from),
    }
  }

  fn notify_failure(&mut self, model_id: &str, message: &str) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Log(output) => output
        .notify_failure(model_id, message)
        .map_err(|never| match never {}),
      #[cfg(feature = "directory_record")]
      OutputWrapper::Record(output) => output
        .notify_failure(model_id, message)
        .map_err(OutputError::from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Default)]
  struct Collect {
    frames: Vec<u64>,
    failures: Vec<String>,
  }

  impl Visualizer for Collect {
    type Error = ();

    fn show(&mut self, result: &FrameResult) -> Result<(), ()> {
      self.frames.push(result.sequence);
      Ok(())
    }

    fn notify_failure(&mut self, model_id: &str, _message: &str) -> Result<(), ()> {
      self.failures.push(model_id.to_string());
      Ok(())
    }
  }

  fn result(sequence: u64, fps: Option<f64>) -> FrameResult {
    FrameResult {
      sequence,
      model_id: "m".into(),
      detections: Vec::new(),
      elapsed: Duration::from_millis(50),
      fps,
      source_width: 640,
      source_height: 480,
    }
  }

  #[test]
  fn fps_label_rounds() {
    assert_eq!(result(0, Some(20.0)).fps_label(), "20 fps");
    assert_eq!(result(0, Some(23.6)).fps_label(), "24 fps");
    assert_eq!(result(0, None).fps_label(), "");
  }

  #[test]
  fn loop_dispatches_in_order() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut ui = UiLoop::new(rx, Collect::default());
    tx.send(UiEvent::Frame(result(1, None))).unwrap();
    tx.send(UiEvent::Failure {
      model_id: "m".into(),
      message: "boom".into(),
    })
    .unwrap();
    tx.send(UiEvent::Frame(result(2, None))).unwrap();

    assert_eq!(ui.pump(), Ok(3));
    assert_eq!(ui.step(Duration::from_millis(1)), Ok(UiStep::Idle));
    drop(tx);
    assert_eq!(ui.step(Duration::from_millis(1)), Ok(UiStep::Closed));

    let collected = ui.into_inner();
    assert_eq!(collected.frames, [1, 2]);
    assert_eq!(collected.failures, ["m"]);
  }

  #[test]
  fn output_from_url() {
    let url = Url::parse("log://").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Ok(OutputWrapper::Log(_))
    ));
    let url = Url::parse("http://example.com").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Err(OutputError::SchemeMismatch)
    ));
  }
}
