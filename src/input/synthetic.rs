// 该文件是 Tanjing （探镜） 项目的一部分。
// src/input/synthetic.rs - 合成帧来源
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
};

use tracing::{debug, info};
use url::Url;

use super::{
  FrameCallback, FrameSource, Pacer, RegistrationError, SourceHandle, invalid_parameter,
  parse_fps,
};
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, PixelFormat},
};

/// 生成逐帧平移的渐变图像，用于压测与无摄像头环境
///
/// `synthetic://640x480?fps=30&frames=300&format=yuyv`
#[derive(Debug, Clone)]
pub struct SyntheticSource {
  width: u32,
  height: u32,
  fps: f64,
  frames: Option<u64>,
  format: PixelFormat,
}

impl SyntheticSource {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      width,
      height,
      fps: 30.0,
      frames: None,
      format: PixelFormat::Rgba8,
    }
  }

  pub fn with_fps(mut self, fps: f64) -> Self {
    self.fps = fps;
    self
  }

  pub fn with_frames(mut self, frames: Option<u64>) -> Self {
    self.frames = frames;
    self
  }

  pub fn with_format(mut self, format: PixelFormat) -> Self {
    self.format = format;
    self
  }

  fn render(&self, index: u64, buffer: &mut Vec<u8>) {
    let (width, height) = (self.width as usize, self.height as usize);
    let shift = index as usize;
    buffer.clear();
    for y in 0..height {
      let g = (y * 255 / height.max(1)) as u8;
      match self.format {
        PixelFormat::Yuyv => {
          for x in (0..width).step_by(2) {
            let y0 = ((x + shift) % 256) as u8;
            let y1 = ((x + 1 + shift) % 256) as u8;
            buffer.extend_from_slice(&[y0, 128, y1, g]);
          }
        }
        _ => {
          for x in 0..width {
            let r = ((x + shift) % 256) as u8;
            let b = (255 - r as u16) as u8;
            match self.format {
              PixelFormat::Rgba8 => buffer.extend_from_slice(&[r, g, b, 255]),
              PixelFormat::Bgra8 => buffer.extend_from_slice(&[b, g, r, 255]),
              PixelFormat::Rgb8 => buffer.extend_from_slice(&[r, g, b]),
              PixelFormat::Bgr8 => buffer.extend_from_slice(&[b, g, r]),
              _ => buffer.push(r),
            }
          }
        }
      }
    }
  }
}

fn parse_format(value: &str) -> Result<PixelFormat, RegistrationError> {
  match value {
    "rgba" => Ok(PixelFormat::Rgba8),
    "bgra" => Ok(PixelFormat::Bgra8),
    "rgb" => Ok(PixelFormat::Rgb8),
    "bgr" => Ok(PixelFormat::Bgr8),
    "gray" => Ok(PixelFormat::Gray8),
    "yuyv" => Ok(PixelFormat::Yuyv),
    _ => Err(invalid_parameter("format", value)),
  }
}

impl FromUrlWithScheme for SyntheticSource {
  const SCHEME: &'static str = "synthetic";
}

impl FromUrl for SyntheticSource {
  type Error = RegistrationError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RegistrationError::SchemeMismatch);
    }

    let size = url.host_str().unwrap_or_default();
    let (width, height) = size
      .split_once('x')
      .and_then(|(w, h)| Some((w.parse().ok()?, h.parse().ok()?)))
      .ok_or_else(|| invalid_parameter("size", size))?;

    let mut source = SyntheticSource::new(width, height);
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "fps" => source.fps = parse_fps(&value)?,
        "frames" => {
          source.frames = Some(value.parse().map_err(|_| invalid_parameter(&key, &value))?)
        }
        "format" => source.format = parse_format(&value)?,
        _ => {}
      }
    }

    Ok(source)
  }
}

impl FrameSource for SyntheticSource {
  fn start(self, mut callback: FrameCallback) -> Result<SourceHandle, RegistrationError> {
    if self.width == 0 || self.height == 0 {
      return Err(RegistrationError::InvalidSize {
        width: self.width,
        height: self.height,
      });
    }
    if matches!(self.format, PixelFormat::Other(_)) {
      return Err(invalid_parameter("format", &format!("{:?}", self.format)));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let name = format!("synthetic-{}x{}", self.width, self.height);
    info!(
      "启动合成来源 {}，帧率 {}，格式 {:?}",
      name, self.fps, self.format
    );

    let thread = thread::Builder::new().name(name.clone()).spawn(move || {
      let mut pacer = Pacer::new(self.fps);
      let mut buffer = Vec::new();
      let mut index = 0u64;
      while self.frames.is_none_or(|n| index < n) && pacer.wait(&flag) {
        self.render(index, &mut buffer);
        callback(&Frame::new(self.format, self.width, self.height, &buffer));
        index += 1;
      }
      debug!("合成来源共产生 {} 帧", index);
      flag.store(true, Ordering::Release);
    })?;

    Ok(SourceHandle::new(name, stop, thread))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  #[test]
  fn url_parameters() {
    let url = Url::parse("synthetic://320x240?fps=15&frames=10&format=yuyv").unwrap();
    let source = SyntheticSource::from_url(&url).unwrap();
    assert_eq!((source.width, source.height), (320, 240));
    assert_eq!(source.fps, 15.0);
    assert_eq!(source.frames, Some(10));
    assert_eq!(source.format, PixelFormat::Yuyv);

    let bad = Url::parse("synthetic://wide?fps=15").unwrap();
    assert!(SyntheticSource::from_url(&bad).is_err());
  }

  #[test]
  fn zero_size_is_registration_error() {
    let result = SyntheticSource::new(0, 10).start(Box::new(|_: &Frame<'_>| {}));
    assert!(matches!(
      result,
      Err(RegistrationError::InvalidSize { width: 0, height: 10 })
    ));
  }

  #[test]
  fn produces_requested_frames() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut handle = SyntheticSource::new(5, 3)
      .with_fps(0.0)
      .with_frames(Some(4))
      .with_format(PixelFormat::Yuyv)
      .start(Box::new(move |frame: &Frame<'_>| {
        sink.lock().unwrap().push((frame.width, frame.data.len()));
      }))
      .unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !handle.is_finished() && std::time::Instant::now() < deadline {
      thread::sleep(std::time::Duration::from_millis(5));
    }
    handle.stop();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 4);
    assert!(seen.iter().all(|&(w, len)| w == 5 && len == 3 * 3 * 4));
  }
}
