// 该文件是 Tanjing （探镜） 项目的一部分。
// src/pipeline/watchdog.rs - 推理看门狗
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
  thread::{self, JoinHandle},
  time::Duration,
};

use tracing::{debug, warn};

use super::Core;

/// 周期检查正在进行的推理，超时后收回准入许可，防止卡死的引擎饿死后续帧
pub(super) struct Watchdog {
  stop: Arc<AtomicBool>,
  handle: Option<JoinHandle<()>>,
}

impl Watchdog {
  pub(super) fn spawn(
    core: Arc<Core>,
    timeout: Duration,
    interval: Duration,
  ) -> std::io::Result<Self> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let handle = thread::Builder::new()
      .name("tanjing-watchdog".into())
      .spawn(move || {
        debug!("看门狗启动，超时 {:?}，检查间隔 {:?}", timeout, interval);
        while !flag.load(Ordering::Acquire) {
          thread::sleep(interval);
          if flag.load(Ordering::Acquire) {
            break;
          }
          if core.check_stalled(timeout) {
            warn!("看门狗已处理一次推理超时");
          }
        }
        debug!("看门狗退出");
      })?;

    Ok(Self {
      stop,
      handle: Some(handle),
    })
  }

  pub(super) fn stop(&mut self) {
    self.stop.store(true, Ordering::Release);
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        warn!("看门狗线程异常退出");
      }
    }
  }
}

impl Drop for Watchdog {
  fn drop(&mut self) {
    self.stop();
  }
}
