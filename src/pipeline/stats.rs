// 该文件是 Tanjing （探镜） 项目的一部分。
// src/pipeline/stats.rs - 流水线计数
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

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub(crate) struct PipelineStats {
  pub(crate) admitted: AtomicU64,
  pub(crate) rejected_busy: AtomicU64,
  pub(crate) not_ready: AtomicU64,
  pub(crate) worker_unavailable: AtomicU64,
  pub(crate) conversion_failed: AtomicU64,
  pub(crate) inference_failed: AtomicU64,
  pub(crate) published: AtomicU64,
  pub(crate) discarded: AtomicU64,
  pub(crate) failure_notifications: AtomicU64,
  pub(crate) watchdog_trips: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
  counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
  pub(crate) fn snapshot(&self) -> StatsSnapshot {
    let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
    StatsSnapshot {
      admitted: load(&self.admitted),
      rejected_busy: load(&self.rejected_busy),
      not_ready: load(&self.not_ready),
      worker_unavailable: load(&self.worker_unavailable),
      conversion_failed: load(&self.conversion_failed),
      inference_failed: load(&self.inference_failed),
      published: load(&self.published),
      discarded: load(&self.discarded),
      failure_notifications: load(&self.failure_notifications),
      watchdog_trips: load(&self.watchdog_trips),
    }
  }
}

/// 某一时刻的计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
  /// 通过准入门并且模型就绪的帧
  pub admitted: u64,
  /// 准入门被占用而丢弃
  pub rejected_busy: u64,
  /// 模型未就绪或正在切换而丢弃
  pub not_ready: u64,
  pub worker_unavailable: u64,
  pub conversion_failed: u64,
  pub inference_failed: u64,
  pub published: u64,
  /// 看门狗收回后迟到的结果
  pub discarded: u64,
  pub failure_notifications: u64,
  pub watchdog_trips: u64,
}

impl StatsSnapshot {
  /// 所有被丢弃的帧
  pub fn dropped(&self) -> u64 {
    self.rejected_busy
      + self.not_ready
      + self.worker_unavailable
      + self.conversion_failed
      + self.inference_failed
      + self.discarded
  }
}
