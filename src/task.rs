// 该文件是 Tanjing （探镜） 项目的一部分。
// src/task.rs - 任务
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
  sync::mpsc,
  thread,
  time::{Duration, Instant},
};
use tracing::{info, warn};

use crate::{
  input::FrameSource,
  output::{UiStep, Visualizer},
  pipeline::Pipeline,
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

const UI_POLL: Duration = Duration::from_millis(50);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 注册来源并在当前线程上运行界面循环，直到中断、达到帧数或来源结束
#[derive(Debug)]
pub struct LiveTask {
  frame_number: Option<u64>,
  interrupt: bool,
}

impl Default for LiveTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      interrupt: true,
    }
  }
}

impl LiveTask {
  pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 是否安装 Ctrl-C 处理，一个进程只能安装一次
  pub fn with_interrupt(mut self, interrupt: bool) -> Self {
    self.interrupt = interrupt;
    self
  }
}

impl<'a, S, V, VE> Task<S, &'a Pipeline, V> for LiveTask
where
  S: FrameSource,
  V: Visualizer<Error = VE>,
  VE: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: S, pipeline: &'a Pipeline, output: V) -> Result<(), Self::Error> {
    info!("开始任务...");
    let (tx, rx) = mpsc::channel();

    if self.interrupt {
      ctrlc::set_handler(move || {
        info!("收到中断信号，准备退出...");
        let _ = tx.send(());
        thread::spawn(|| {
          thread::sleep(Duration::from_secs(30));
          warn!("强制退出程序");
          std::process::exit(1);
        });
      })?;
    }

    pipeline.attach(input)?;
    let mut ui = pipeline.ui_loop(output);

    loop {
      if ui.step(UI_POLL)? == UiStep::Closed {
        warn!("事件通道已关闭，退出任务循环");
        break;
      }
      if self.frame_number.is_some_and(|n| ui.shown() >= n) {
        info!("达到指定帧数 {}, 退出任务循环", ui.shown());
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
      if pipeline.source_finished() {
        info!("来源已结束，等待最后一帧");
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while pipeline.gate().is_held() && Instant::now() < deadline {
          ui.step(UI_POLL)?;
        }
        break;
      }
    }

    ui.pump()?;
    pipeline.shutdown();
    info!(
      "任务完成，显示 {} 帧，失败通知 {} 次",
      ui.shown(),
      ui.failures()
    );
    Ok(())
  }
}
