// 该文件是 Tanjing （探镜） 项目的一部分。
// src/input/image_sequence.rs - 目录图像序列输入
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
  path::{Path, PathBuf},
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
};

use image::ImageReader;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
  FrameCallback, FrameSource, Pacer, RegistrationError, SourceHandle, parse_fps,
};
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, PixelFormat},
};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// 按文件名顺序回放目录中的图像
///
/// `folder:///path/to/frames?fps=10&loop`
#[derive(Debug, Clone)]
pub struct ImageSequenceSource {
  directory: PathBuf,
  fps: f64,
  looping: bool,
}

impl ImageSequenceSource {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      fps: 10.0,
      looping: false,
    }
  }

  pub fn with_fps(mut self, fps: f64) -> Self {
    self.fps = fps;
    self
  }

  pub fn with_loop(mut self, looping: bool) -> Self {
    self.looping = looping;
    self
  }

  fn list_images(&self) -> Result<Vec<PathBuf>, RegistrationError> {
    if !self.directory.is_dir() {
      return Err(RegistrationError::DirectoryNotFound(self.directory.clone()));
    }

    let mut images: Vec<PathBuf> = std::fs::read_dir(&self.directory)?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|path| is_image(path))
      .collect();
    images.sort();

    if images.is_empty() {
      return Err(RegistrationError::NoImages(self.directory.clone()));
    }
    Ok(images)
  }
}

fn is_image(path: &Path) -> bool {
  path.is_file()
    && path
      .extension()
      .and_then(|e| e.to_str())
      .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

impl FromUrlWithScheme for ImageSequenceSource {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for ImageSequenceSource {
  type Error = RegistrationError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(RegistrationError::SchemeMismatch);
    }

    let path = urlencoding::decode(url.path())
      .map_err(|_| super::invalid_parameter("path", url.path()))?;
    let mut source = ImageSequenceSource::new(path.into_owned());
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "fps" => source.fps = parse_fps(&value)?,
        "loop" => source.looping = value != "false",
        _ => {}
      }
    }

    Ok(source)
  }
}

impl FrameSource for ImageSequenceSource {
  fn start(self, mut callback: FrameCallback) -> Result<SourceHandle, RegistrationError> {
    let images = self.list_images()?;
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let name = format!("folder-{}", self.directory.display());
    info!(
      "启动目录来源 {}，共 {} 张图像，帧率 {}",
      self.directory.display(),
      images.len(),
      self.fps
    );

    let thread = thread::Builder::new()
      .name("folder-source".into())
      .spawn(move || {
        let mut pacer = Pacer::new(self.fps);
        let mut sent = 0u64;
        'replay: loop {
          for path in images.iter() {
            if !pacer.wait(&flag) {
              break 'replay;
            }
            let image = match ImageReader::open(path).and_then(|r| r.with_guessed_format()) {
              Ok(reader) => match reader.decode() {
                Ok(image) => image.to_rgba8(),
                Err(e) => {
                  warn!("无法解码图像 {}: {}", path.display(), e);
                  continue;
                }
              },
              Err(e) => {
                warn!("无法打开图像 {}: {}", path.display(), e);
                continue;
              }
            };
            let (width, height) = image.dimensions();
            callback(&Frame::new(PixelFormat::Rgba8, width, height, image.as_raw()));
            sent += 1;
          }
          if !self.looping {
            break;
          }
        }
        debug!("目录来源共推送 {} 帧", sent);
        flag.store(true, Ordering::Release);
      })?;

    Ok(SourceHandle::new(name, stop, thread))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgba, RgbaImage};
  use std::sync::Mutex;

  #[test]
  fn missing_directory() {
    let source = ImageSequenceSource::new("/nonexistent/tanjing/frames");
    assert!(matches!(
      source.start(Box::new(|_: &Frame<'_>| {})),
      Err(RegistrationError::DirectoryNotFound(_))
    ));
  }

  #[test]
  fn empty_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();
    assert!(matches!(
      ImageSequenceSource::new(dir.path()).start(Box::new(|_: &Frame<'_>| {})),
      Err(RegistrationError::NoImages(_))
    ));
  }

  #[test]
  fn replays_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    RgbaImage::from_pixel(4, 2, Rgba([1, 2, 3, 255]))
      .save(dir.path().join("b.png"))
      .unwrap();
    RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 255]))
      .save(dir.path().join("a.png"))
      .unwrap();

    let url = Url::parse(&format!("folder://{}?fps=0", dir.path().display())).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut handle = ImageSequenceSource::from_url(&url)
      .unwrap()
      .start(Box::new(move |frame: &Frame<'_>| sink.lock().unwrap().push(frame.width)))
      .unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !handle.is_finished() && std::time::Instant::now() < deadline {
      thread::sleep(std::time::Duration::from_millis(5));
    }
    handle.stop();
    assert_eq!(*seen.lock().unwrap(), [2, 4]);
  }
}
