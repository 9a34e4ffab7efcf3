// 该文件是 Tanjing （探镜） 项目的一部分。
// src/gate.rs - 单许可帧准入门
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

//! # 帧准入门
//!
//! 同一时刻最多只有一帧在处理中。门被占用时到达的帧直接丢弃，不排队，
//! 保证画面始终是实时的，而不是积压后的旧结果。
//!
//! 许可以 [`GatePermit`] 的形式交给持有者，析构时归还，任何退出路径
//! （包括错误与 panic 展开）都恰好归还一次。

use std::{
  collections::VecDeque,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

const FREE: u64 = 0;
/// 记住的被收回票号个数，更早的只保留一个上界
const REVOKED_HISTORY: usize = 8;

#[derive(Debug)]
struct Hold {
  ticket: u64,
  since: Instant,
}

/// 尚未归还的被收回许可
#[derive(Debug, Default)]
struct Revoked {
  recent: VecDeque<u64>,
  forgotten_up_to: u64,
}

impl Revoked {
  fn push(&mut self, ticket: u64) {
    if self.recent.len() == REVOKED_HISTORY {
      if let Some(oldest) = self.recent.pop_front() {
        self.forgotten_up_to = self.forgotten_up_to.max(oldest);
      }
    }
    self.recent.push_back(ticket);
  }

  fn forget(&mut self, ticket: u64) {
    self.recent.retain(|&t| t != ticket);
  }

  /// 票号是否属于被收回的许可，命中时从记录中移除
  fn take(&mut self, ticket: u64) -> bool {
    if let Some(pos) = self.recent.iter().position(|&t| t == ticket) {
      self.recent.remove(pos);
      return true;
    }
    ticket <= self.forgotten_up_to
  }
}

#[derive(Debug, Default)]
struct GateInner {
  holder: AtomicU64,
  next_ticket: AtomicU64,
  hold: Mutex<Option<Hold>>,
  revoked: Mutex<Revoked>,
  admitted: AtomicU64,
  rejected: AtomicU64,
  #[cfg(debug_assertions)]
  released: AtomicU64,
}

/// 单许可准入门，可廉价克隆，克隆共享同一个许可
#[derive(Debug, Clone, Default)]
pub struct FrameGate {
  inner: Arc<GateInner>,
}

impl FrameGate {
  pub fn new() -> Self {
    Self::default()
  }

  /// 非阻塞地尝试获取许可，已被占用时返回 `None`
  pub fn try_enter(&self) -> Option<GatePermit> {
    let inner = &self.inner;
    if inner.holder.load(Ordering::Acquire) != FREE {
      inner.rejected.fetch_add(1, Ordering::Relaxed);
      return None;
    }

    let ticket = inner.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
    if inner
      .holder
      .compare_exchange(FREE, ticket, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      inner.rejected.fetch_add(1, Ordering::Relaxed);
      return None;
    }

    inner.admitted.fetch_add(1, Ordering::SeqCst);
    *inner.hold.lock() = Some(Hold {
      ticket,
      since: Instant::now(),
    });

    Some(GatePermit {
      gate: self.clone(),
      ticket,
    })
  }

  pub fn is_held(&self) -> bool {
    self.inner.holder.load(Ordering::Acquire) != FREE
  }

  /// 已发出的许可数
  pub fn admitted(&self) -> u64 {
    self.inner.admitted.load(Ordering::SeqCst)
  }

  /// 因门被占用而拒绝的次数
  pub fn rejected(&self) -> u64 {
    self.inner.rejected.load(Ordering::Relaxed)
  }

  /// 当前持有者的票号与持有时长
  pub fn held_for(&self) -> Option<(u64, Duration)> {
    let hold = self.inner.hold.lock();
    let hold = hold.as_ref()?;
    if self.inner.holder.load(Ordering::Acquire) != hold.ticket {
      return None;
    }
    Some((hold.ticket, hold.since.elapsed()))
  }

  /// 强制收回指定票号的许可，供看门狗在推理卡死时使用
  ///
  /// 被收回的许可之后的归还会被忽略。
  pub fn revoke(&self, ticket: u64) -> bool {
    let inner = &self.inner;
    // 先登记，避免持有者恰好在此刻归还时被误判为非法归还
    inner.revoked.lock().push(ticket);
    if inner
      .holder
      .compare_exchange(ticket, FREE, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      inner.revoked.lock().forget(ticket);
      return false;
    }

    self.clear_hold(ticket);
    self.count_release();
    warn!("准入门许可 #{} 被强制收回", ticket);
    true
  }

  #[cfg(debug_assertions)]
  fn count_release(&self) {
    let released = self.inner.released.fetch_add(1, Ordering::SeqCst) + 1;
    let admitted = self.inner.admitted.load(Ordering::SeqCst);
    debug_assert!(
      released <= admitted,
      "归还次数 {} 超过准入次数 {}",
      released,
      admitted
    );
  }

  #[cfg(not(debug_assertions))]
  fn count_release(&self) {}

  fn clear_hold(&self, ticket: u64) {
    let mut hold = self.inner.hold.lock();
    if hold.as_ref().map(|h| h.ticket) == Some(ticket) {
      *hold = None;
    }
  }

  fn release_ticket(&self, ticket: u64) {
    let inner = &self.inner;
    if inner
      .holder
      .compare_exchange(ticket, FREE, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      self.clear_hold(ticket);
      self.count_release();
      return;
    }

    if inner.revoked.lock().take(ticket) {
      debug!("忽略已被收回的许可 #{} 的归还", ticket);
      return;
    }

    error!("许可 #{} 的归还与持有者不匹配", ticket);
    debug_assert!(false, "许可 #{} 的归还与持有者不匹配", ticket);
  }
}

/// 准入许可，析构时归还
#[derive(Debug)]
#[must_use = "许可被丢弃时会立即归还"]
pub struct GatePermit {
  gate: FrameGate,
  ticket: u64,
}

impl GatePermit {
  pub fn ticket(&self) -> u64 {
    self.ticket
  }

  /// 许可是否已被看门狗收回
  pub fn is_revoked(&self) -> bool {
    self.gate.inner.holder.load(Ordering::Acquire) != self.ticket
  }

  /// 显式归还，等价于析构
  pub fn release(self) {}
}

impl Drop for GatePermit {
  fn drop(&mut self) {
    self.gate.release_ticket(self.ticket);
  }
}
