// 该文件是 Tanjing （探镜） 项目的一部分。
// src/output/record.rs - 目录记录输出
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
  fs::OpenOptions,
  io::Write,
  path::{Path, PathBuf},
};

use chrono::{Datelike, Local};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{FrameResult, Visualizer},
};

const FAILURE_LOG: &str = "failures.txt";

#[derive(Error, Debug)]
pub enum RecordVisualizerError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 每个发布的帧写一份文本记录，按日期分目录
///
/// `folder:///var/lib/tanjing/records?always`，默认跳过没有检测结果的帧。
pub struct RecordVisualizer {
  directory: PathBuf,
  frame_counter: u16,
  always: bool,
}

impl FromUrlWithScheme for RecordVisualizer {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for RecordVisualizer {
  type Error = RecordVisualizerError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(RecordVisualizerError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");
    let directory = urlencoding::decode(uri.path())
      .map(|p| PathBuf::from(p.into_owned()))
      .unwrap_or_else(|_| PathBuf::from(uri.path()));

    Ok(RecordVisualizer::new(directory).with_always(always))
  }
}

impl RecordVisualizer {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      frame_counter: 0,
      always: false,
    }
  }

  pub fn with_always(mut self, always: bool) -> Self {
    self.always = always;
    self
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn frame_id(&mut self) -> u16 {
    self.frame_counter = self.frame_counter.wrapping_add(1);
    self.frame_counter
  }

  fn day_directory(&self) -> Result<PathBuf, RecordVisualizerError> {
    let now = Local::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }
    Ok(directory)
  }

  fn record_path(&mut self) -> Result<PathBuf, RecordVisualizerError> {
    let directory = self.day_directory()?;
    let now = Local::now();
    Ok(directory.join(format!(
      "{}-{:04X}.txt",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Visualizer for RecordVisualizer {
  type Error = RecordVisualizerError;

  fn show(&mut self, result: &FrameResult) -> Result<(), Self::Error> {
    if !self.always && result.detections.is_empty() {
      return Ok(());
    }

    let mut records = vec![format!(
      "# {} {}x{} {:.2}ms {}",
      result.model_id,
      result.source_width,
      result.source_height,
      result.elapsed.as_secs_f64() * 1000.0,
      result.fps_label()
    )];
    for item in result.detections.iter() {
      let bbox = item.bounding_box;
      records.push(format!(
        "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
        item.tag_name, item.probability, bbox.left, bbox.top, bbox.width, bbox.height
      ));
    }

    let path = self.record_path()?;
    std::fs::write(&path, records.join("\n"))?;
    debug!("写入记录: {}", path.display());
    Ok(())
  }

  fn notify_failure(&mut self, model_id: &str, message: &str) -> Result<(), Self::Error> {
    let path = self.day_directory()?.join(FAILURE_LOG);
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
      file,
      "{} {}: {}",
      Local::now().format("%H:%M:%S"),
      model_id,
      message
    )?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{BoundingBox, Detection};
  use std::time::Duration;

  fn result(detections: Vec<Detection>) -> FrameResult {
    FrameResult {
      sequence: 1,
      model_id: "general".into(),
      detections,
      elapsed: Duration::from_millis(50),
      fps: Some(20.0),
      source_width: 640,
      source_height: 480,
    }
  }

  fn records(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
      for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
          stack.push(path);
        } else {
          found.push(path);
        }
      }
    }
    found
  }

  #[test]
  fn empty_frames_skipped_unless_always() {
    let dir = tempfile::tempdir().unwrap();
    let mut output = RecordVisualizer::new(dir.path());
    output.show(&result(Vec::new())).unwrap();
    assert!(records(dir.path()).is_empty());

    let mut output = output.with_always(true);
    output.show(&result(Vec::new())).unwrap();
    assert_eq!(records(dir.path()).len(), 1);
  }

  #[test]
  fn writes_one_line_per_detection() {
    let dir = tempfile::tempdir().unwrap();
    let mut output = RecordVisualizer::new(dir.path());
    output
      .show(&result(vec![Detection::new(
        "person",
        0.9,
        BoundingBox::new(0.1, 0.2, 0.3, 0.4),
      )]))
      .unwrap();

    let files = records(dir.path());
    assert_eq!(files.len(), 1);
    let text = std::fs::read_to_string(&files[0]).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines[0], "# general 640x480 50.00ms 20 fps");
    assert_eq!(lines[1], "person, 0.9000, 0.1000, 0.2000, 0.3000, 0.4000");
  }

  #[test]
  fn failures_are_appended() {
    let dir = tempfile::tempdir().unwrap();
    let mut output = RecordVisualizer::new(dir.path());
    output.notify_failure("general", "引擎崩溃").unwrap();
    output.notify_failure("general", "引擎崩溃").unwrap();
    let files = records(dir.path());
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with(FAILURE_LOG));
    assert_eq!(std::fs::read_to_string(&files[0]).unwrap().lines().count(), 2);
  }

  #[test]
  fn from_url_reads_always() {
    let url = url::Url::parse("folder:///tmp/records?always").unwrap();
    let output = RecordVisualizer::from_url(&url).unwrap();
    assert!(output.always);
    assert_eq!(output.directory(), Path::new("/tmp/records"));
  }
}
