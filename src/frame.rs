// 该文件是 Tanjing （探镜） 项目的一部分。
// src/frame.rs - 帧定义
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

use serde::{Deserialize, Serialize};

const OPAQUE_CHANNELS: usize = 3;

pub trait AsNhwcFrame {
  fn as_nhwc(&self) -> &[u8];
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
  Rgba8,
  Bgra8,
  Rgb8,
  Bgr8,
  Gray8,
  /// YUYV 4:2:2，两个像素共用 4 字节
  Yuyv,
  /// 其他 FourCC 格式，预处理不支持
  Other([u8; 4]),
}

impl PixelFormat {
  /// 每行的字节数
  pub fn row_bytes(&self, width: u32) -> Option<usize> {
    let width = width as usize;
    match self {
      PixelFormat::Rgba8 | PixelFormat::Bgra8 => Some(width * 4),
      PixelFormat::Rgb8 | PixelFormat::Bgr8 => Some(width * 3),
      PixelFormat::Gray8 => Some(width),
      PixelFormat::Yuyv => Some(width.div_ceil(2) * 4),
      PixelFormat::Other(_) => None,
    }
  }

  pub fn from_fourcc(fourcc: &[u8; 4]) -> Self {
    match fourcc {
      b"RGBA" => PixelFormat::Rgba8,
      b"BGRA" => PixelFormat::Bgra8,
      b"RGB3" => PixelFormat::Rgb8,
      b"BGR3" => PixelFormat::Bgr8,
      b"GREY" => PixelFormat::Gray8,
      b"YUYV" => PixelFormat::Yuyv,
      other => PixelFormat::Other(*other),
    }
  }
}

/// 模型输入的通道顺序（均不含 alpha）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
  #[default]
  Bgr,
  Rgb,
}

/// 解码器回调交给流水线的帧
///
/// 数据属于解码器，回调返回后可能被立刻复用，需要保留时调用 [`Frame::to_owned_frame`]。
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
  pub format: PixelFormat,
  pub width: u32,
  pub height: u32,
  pub data: &'a [u8],
}

impl<'a> Frame<'a> {
  pub fn new(format: PixelFormat, width: u32, height: u32, data: &'a [u8]) -> Self {
    Self {
      format,
      width,
      height,
      data,
    }
  }

  pub fn to_owned_frame(&self) -> OwnedFrame {
    OwnedFrame {
      format: self.format,
      width: self.width,
      height: self.height,
      data: self.data.into(),
    }
  }
}

/// 流水线持有的帧拷贝
#[derive(Debug, Clone)]
pub struct OwnedFrame {
  pub format: PixelFormat,
  pub width: u32,
  pub height: u32,
  pub data: Box<[u8]>,
}

impl OwnedFrame {
  pub fn as_frame(&self) -> Frame<'_> {
    Frame {
      format: self.format,
      width: self.width,
      height: self.height,
      data: &self.data,
    }
  }
}

/// 预处理后的模型输入，`size x size` 的 HWC 三通道数据
#[derive(Debug, Clone)]
pub struct PreparedFrame {
  size: u32,
  order: ChannelOrder,
  data: Box<[u8]>,
}

impl PreparedFrame {
  pub(crate) fn from_parts(size: u32, order: ChannelOrder, data: Vec<u8>) -> Self {
    let expected = OPAQUE_CHANNELS * size as usize * size as usize;
    assert_eq!(
      data.len(),
      expected,
      "数据长度不匹配: 期望长度 {}, 实际长度 {}",
      expected,
      data.len()
    );

    Self {
      size,
      order,
      data: data.into_boxed_slice(),
    }
  }

  pub fn size(&self) -> u32 {
    self.size
  }

  pub fn width(&self) -> usize {
    self.size as usize
  }

  pub fn height(&self) -> usize {
    self.size as usize
  }

  pub fn channels(&self) -> usize {
    OPAQUE_CHANNELS
  }

  pub fn channel_order(&self) -> ChannelOrder {
    self.order
  }

  pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
    let idx = (y as usize * self.width() + x as usize) * OPAQUE_CHANNELS;
    [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
  }
}

impl AsNhwcFrame for PreparedFrame {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn row_bytes_per_format() {
    assert_eq!(PixelFormat::Rgba8.row_bytes(10), Some(40));
    assert_eq!(PixelFormat::Bgr8.row_bytes(10), Some(30));
    assert_eq!(PixelFormat::Gray8.row_bytes(10), Some(10));
    assert_eq!(PixelFormat::Yuyv.row_bytes(3), Some(8));
    assert_eq!(PixelFormat::from_fourcc(b"NV12").row_bytes(10), None);
  }

  #[test]
  fn owned_copy_is_independent() {
    let mut buffer = vec![1u8; 2 * 2 * 4];
    let owned = Frame::new(PixelFormat::Rgba8, 2, 2, &buffer).to_owned_frame();
    buffer.fill(9);
    assert!(owned.data.iter().all(|&b| b == 1));
    assert_eq!(owned.as_frame().width, 2);
  }

  #[test]
  fn prepared_pixels_are_interleaved() {
    let frame = PreparedFrame::from_parts(
      2,
      ChannelOrder::Rgb,
      vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
    );
    assert_eq!(frame.as_nhwc().len(), 12);
    assert_eq!(frame.pixel(1, 0), [4, 5, 6]);
    assert_eq!(frame.pixel(0, 1), [7, 8, 9]);
  }
}
