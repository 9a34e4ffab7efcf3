// 该文件是 Tanjing （探镜） 项目的一部分。
// src/input.rs - 帧来源
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
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

#[cfg(feature = "image_sequence")]
mod image_sequence;
#[cfg(feature = "image_sequence")]
pub use self::image_sequence::ImageSequenceSource;

mod synthetic;
pub use self::synthetic::SyntheticSource;

/// 解码器每产出一帧调用一次，运行在来源自己的线程上
pub type FrameCallback = Box<dyn FnMut(&Frame<'_>) + Send + 'static>;

/// 帧来源，启动后在自己的线程上推送帧
pub trait FrameSource {
  fn start(self, callback: FrameCallback) -> Result<SourceHandle, RegistrationError>;
}

#[derive(Error, Debug)]
pub enum RegistrationError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("无效的参数 {key}: {value}")]
  InvalidParameter { key: String, value: String },
  #[error("无效的帧尺寸: {width}x{height}")]
  InvalidSize { width: u32, height: u32 },
  #[error("目录不存在: {0}")]
  DirectoryNotFound(PathBuf),
  #[error("目录中没有图像: {0}")]
  NoImages(PathBuf),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("来源已经注册")]
  AlreadyAttached,
}

pub(crate) fn invalid_parameter(key: &str, value: &str) -> RegistrationError {
  RegistrationError::InvalidParameter {
    key: key.to_string(),
    value: value.to_string(),
  }
}

fn parse_fps(value: &str) -> Result<f64, RegistrationError> {
  match value.parse::<f64>() {
    Ok(fps) if fps.is_finite() && fps >= 0.0 => Ok(fps),
    _ => Err(invalid_parameter("fps", value)),
  }
}

/// 按帧率节拍推送，帧率为零时不等待
pub(crate) struct Pacer {
  interval: Option<Duration>,
  next: Instant,
}

impl Pacer {
  pub(crate) fn new(fps: f64) -> Self {
    Self {
      interval: (fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps)),
      next: Instant::now(),
    }
  }

  /// 等到下一帧的时间点，等待期间被要求停止时返回 `false`
  pub(crate) fn wait(&mut self, stop: &AtomicBool) -> bool {
    if let Some(interval) = self.interval {
      let now = Instant::now();
      if self.next > now {
        let mut remaining = self.next - now;
        // 分段睡眠以便及时响应停止
        while !remaining.is_zero() {
          if stop.load(Ordering::Acquire) {
            return false;
          }
          let step = remaining.min(PACER_STEP);
          thread::sleep(step);
          remaining = remaining.saturating_sub(step);
        }
        self.next += interval;
      } else {
        self.next = now + interval;
      }
    }
    !stop.load(Ordering::Acquire)
  }
}

const PACER_STEP: Duration = Duration::from_millis(20);

/// 正在运行的来源，析构时停止并等待线程退出
#[derive(Debug)]
pub struct SourceHandle {
  name: String,
  stop: Arc<AtomicBool>,
  thread: Option<JoinHandle<()>>,
}

impl SourceHandle {
  pub(crate) fn new(name: impl Into<String>, stop: Arc<AtomicBool>, thread: JoinHandle<()>) -> Self {
    Self {
      name: name.into(),
      stop,
      thread: Some(thread),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// 来源线程是否已经退出（帧用尽或被停止）
  pub fn is_finished(&self) -> bool {
    self.thread.as_ref().is_none_or(|t| t.is_finished())
  }

  pub fn stop(&mut self) {
    self.stop.store(true, Ordering::Release);
    if let Some(thread) = self.thread.take() {
      if thread.join().is_err() {
        warn!("来源 {} 的线程异常退出", self.name);
      }
      debug!("来源 {} 已停止", self.name);
    }
  }
}

impl Drop for SourceHandle {
  fn drop(&mut self) {
    self.stop();
  }
}

pub enum InputWrapper {
  #[cfg(feature = "image_sequence")]
  ImageSequence(ImageSequenceSource),
  Synthetic(SyntheticSource),
}

impl FromUrl for InputWrapper {
  type Error = RegistrationError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "image_sequence")]
      ImageSequenceSource::SCHEME => Ok(InputWrapper::ImageSequence(
        ImageSequenceSource::from_url(url)?,
      )),
      SyntheticSource::SCHEME => Ok(InputWrapper::Synthetic(SyntheticSource::from_url(url)?)),
      _ => Err(RegistrationError::SchemeMismatch),
    }
  }
}

impl FrameSource for InputWrapper {
  fn start(self, callback: FrameCallback) -> Result<SourceHandle, RegistrationError> {
    match self {
      #[cfg(feature = "image_sequence")]
      InputWrapper::ImageSequence(source) => source.start(callback),
      InputWrapper::Synthetic(source) => source.start(callback),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_scheme() {
    let url = Url::parse("rtsp://camera.local/stream").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(RegistrationError::SchemeMismatch)
    ));
  }

  #[test]
  fn synthetic_scheme_dispatch() {
    let url = Url::parse("synthetic://64x48?fps=0&frames=1").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Ok(InputWrapper::Synthetic(_))
    ));
  }
}
