// 该文件是 Tanjing （探镜） 项目的一部分。
// src/preprocess.rs - 帧预处理
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

use image::{RgbImage, imageops};
use thiserror::Error;
use tracing::debug;

use crate::frame::{ChannelOrder, Frame, PixelFormat, PreparedFrame};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
  #[error("帧尺寸为零: {width}x{height}")]
  EmptyFrame { width: u32, height: u32 },
  #[error("不支持的像素格式: {0:?}")]
  UnsupportedFormat(PixelFormat),
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("无效的目标尺寸: {0}")]
  InvalidTargetSize(u32),
}

/// 把任意分辨率、任意支持格式的帧缩放为模型需要的正方形三通道输入
#[derive(Debug, Clone)]
pub struct FramePreprocessor {
  order: ChannelOrder,
}

impl Default for FramePreprocessor {
  fn default() -> Self {
    Self::new(ChannelOrder::default())
  }
}

impl FramePreprocessor {
  pub fn new(order: ChannelOrder) -> Self {
    Self { order }
  }

  pub fn channel_order(&self) -> ChannelOrder {
    self.order
  }

  /// 生成 `target_size x target_size` 的输入，不修改源帧
  ///
  /// 不保持宽高比，整帧拉伸到目标尺寸。
  pub fn prepare(
    &self,
    frame: &Frame<'_>,
    target_size: u32,
  ) -> Result<PreparedFrame, ConversionError> {
    if target_size == 0 {
      return Err(ConversionError::InvalidTargetSize(target_size));
    }

    let image = to_rgb_image(frame)?;
    let image = if image.dimensions() == (target_size, target_size) {
      image
    } else {
      debug!(
        "缩放帧 {}x{} -> {}x{}",
        frame.width, frame.height, target_size, target_size
      );
      imageops::resize(
        &image,
        target_size,
        target_size,
        imageops::FilterType::Triangle,
      )
    };

    let mut data = image.into_raw();
    if self.order == ChannelOrder::Bgr {
      for pixel in data.chunks_exact_mut(3) {
        pixel.swap(0, 2);
      }
    }

    Ok(PreparedFrame::from_parts(target_size, self.order, data))
  }
}

fn to_rgb_image(frame: &Frame<'_>) -> Result<RgbImage, ConversionError> {
  let (width, height) = (frame.width, frame.height);
  if width == 0 || height == 0 {
    return Err(ConversionError::EmptyFrame { width, height });
  }

  let row_bytes = frame
    .format
    .row_bytes(width)
    .ok_or(ConversionError::UnsupportedFormat(frame.format))?;
  let expected = row_bytes * height as usize;
  if frame.data.len() < expected {
    return Err(ConversionError::BufferSizeMismatch {
      expected,
      actual: frame.data.len(),
    });
  }
  let data = &frame.data[..expected];

  let pixel_count = width as usize * height as usize;
  let mut rgb = Vec::with_capacity(pixel_count * 3);
  match frame.format {
    PixelFormat::Rgb8 => rgb.extend_from_slice(data),
    PixelFormat::Bgr8 => {
      for p in data.chunks_exact(3) {
        rgb.extend_from_slice(&[p[2], p[1], p[0]]);
      }
    }
    // alpha 直接丢弃
    PixelFormat::Rgba8 => {
      for p in data.chunks_exact(4) {
        rgb.extend_from_slice(&[p[0], p[1], p[2]]);
      }
    }
    PixelFormat::Bgra8 => {
      for p in data.chunks_exact(4) {
        rgb.extend_from_slice(&[p[2], p[1], p[0]]);
      }
    }
    PixelFormat::Gray8 => {
      for &v in data {
        rgb.extend_from_slice(&[v, v, v]);
      }
    }
    PixelFormat::Yuyv => {
      for row in data.chunks_exact(row_bytes) {
        yuyv_row_to_rgb(row, width as usize, &mut rgb);
      }
    }
    PixelFormat::Other(_) => return Err(ConversionError::UnsupportedFormat(frame.format)),
  }

  RgbImage::from_raw(width, height, rgb).ok_or(ConversionError::BufferSizeMismatch {
    expected: pixel_count * 3,
    actual: 0,
  })
}

/// 将一行 YUYV 转换为 RGB，奇数宽度时丢弃最后一个补齐像素
fn yuyv_row_to_rgb(row: &[u8], width: usize, rgb: &mut Vec<u8>) {
  let mut written = 0;
  for chunk in row.chunks_exact(4) {
    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    for y in [y0, y1] {
      if written == width {
        return;
      }
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
      written += 1;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::AsNhwcFrame;

  #[test]
  fn rgba_100_to_416_opaque() {
    let data = vec![200u8; 100 * 100 * 4];
    let frame = Frame::new(PixelFormat::Rgba8, 100, 100, &data);
    let prepared = FramePreprocessor::default().prepare(&frame, 416).unwrap();

    assert_eq!(prepared.size(), 416);
    assert_eq!(prepared.channels(), 3);
    assert_eq!(prepared.as_nhwc().len(), 416 * 416 * 3);
    assert_eq!(prepared.channel_order(), ChannelOrder::Bgr);
    assert!(data.iter().all(|&b| b == 200), "源帧不应被修改");
  }

  #[test]
  fn bgr_output_swaps_channels() {
    // 单个红色 RGBA 像素
    let data = [255u8, 0, 0, 255];
    let frame = Frame::new(PixelFormat::Rgba8, 1, 1, &data);

    let bgr = FramePreprocessor::new(ChannelOrder::Bgr)
      .prepare(&frame, 1)
      .unwrap();
    assert_eq!(bgr.pixel(0, 0), [0, 0, 255]);

    let rgb = FramePreprocessor::new(ChannelOrder::Rgb)
      .prepare(&frame, 1)
      .unwrap();
    assert_eq!(rgb.pixel(0, 0), [255, 0, 0]);
  }

  #[test]
  fn bgra_and_gray_are_supported() {
    let bgra = [10u8, 20, 30, 0];
    let frame = Frame::new(PixelFormat::Bgra8, 1, 1, &bgra);
    let prepared = FramePreprocessor::new(ChannelOrder::Rgb)
      .prepare(&frame, 1)
      .unwrap();
    assert_eq!(prepared.pixel(0, 0), [30, 20, 10]);

    let gray = [77u8; 4];
    let frame = Frame::new(PixelFormat::Gray8, 2, 2, &gray);
    let prepared = FramePreprocessor::default().prepare(&frame, 2).unwrap();
    assert_eq!(prepared.pixel(1, 1), [77, 77, 77]);
  }

  #[test]
  fn yuyv_odd_width() {
    // 3 像素宽需要 2 个 YUYV 组
    let data = [128u8, 128, 128, 128, 128, 128, 128, 128];
    let frame = Frame::new(PixelFormat::Yuyv, 3, 1, &data);
    let image = to_rgb_image(&frame).unwrap();
    assert_eq!(image.dimensions(), (3, 1));
    assert_eq!(image.get_pixel(2, 0).0, [128, 128, 128]);

    assert_eq!(
      FramePreprocessor::default().prepare(&frame, 0).unwrap_err(),
      ConversionError::InvalidTargetSize(0)
    );
  }

  #[test]
  fn zero_dimensions_fail() {
    let frame = Frame::new(PixelFormat::Rgba8, 0, 10, &[]);
    assert_eq!(
      FramePreprocessor::default().prepare(&frame, 416).unwrap_err(),
      ConversionError::EmptyFrame {
        width: 0,
        height: 10
      }
    );
  }

  #[test]
  fn unsupported_format_fails() {
    let data = vec![0u8; 64];
    let frame = Frame::new(PixelFormat::from_fourcc(b"NV12"), 4, 4, &data);
    assert!(matches!(
      FramePreprocessor::default().prepare(&frame, 416),
      Err(ConversionError::UnsupportedFormat(PixelFormat::Other(_)))
    ));
  }

  #[test]
  fn short_buffer_fails() {
    let data = vec![0u8; 10];
    let frame = Frame::new(PixelFormat::Rgb8, 4, 4, &data);
    assert_eq!(
      FramePreprocessor::default().prepare(&frame, 416).unwrap_err(),
      ConversionError::BufferSizeMismatch {
        expected: 48,
        actual: 10
      }
    );
  }
}
