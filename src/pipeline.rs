// 该文件是 Tanjing （探镜） 项目的一部分。
// src/pipeline.rs - 流水线编排
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

//! # 流水线
//!
//! 来源回调只做有界的工作：尝试准入、检查模型就绪、复制帧、交给推理线程。
//! 预处理与推理在唯一的工作线程上进行，结果通过消息交给界面线程。
//!
//! ```text
//! 来源线程 ──try_enter──▶ 复制帧 ──bounded(1)──▶ 工作线程 ──UiEvent──▶ UiLoop
//!                                                  │
//!                                          许可在此处归还
//! ```

use std::{
  panic::{self, AssertUnwindSafe},
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  catalog::{ModelCatalog, ModelDescriptor},
  config::PipelineConfig,
  frame::{Frame, OwnedFrame},
  gate::{FrameGate, GatePermit},
  inference::{InferenceError, InferenceInvoker},
  input::{FrameSource, RegistrationError, SourceHandle},
  model::{ActiveModel, LoadError, ModelLoader, ModelSlot},
  output::{FrameResult, UiEvent, UiLoop, Visualizer},
  preprocess::{ConversionError, FramePreprocessor},
};

mod stats;
mod watchdog;

pub use self::stats::StatsSnapshot;
use self::{
  stats::{PipelineStats, bump},
  watchdog::Watchdog,
};

/// 关闭时等待推理线程的上限，卡住的引擎调用不会拖住关闭
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("无效的配置: {0}")]
  InvalidConfig(String),
  #[error("无法启动线程: {0}")]
  Spawn(#[from] std::io::Error),
}

/// 帧被丢弃的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
  /// 上一帧仍在处理中
  GateBusy,
  /// 没有可用模型，或模型正在切换
  NotReady,
  /// 推理线程不可用
  WorkerUnavailable,
}

/// 回调线程上的准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAdmission {
  Admitted { sequence: u64 },
  Dropped(DropReason),
}

/// 一帧完整处理后的结果
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
  Published(FrameResult),
  Dropped(DropReason),
  ConversionFailed(ConversionError),
  InferenceFailed(InferenceError),
  /// 推理超时被看门狗收回，结果作废
  Revoked,
}

struct Job {
  frame: OwnedFrame,
  permit: GatePermit,
  model: Arc<ActiveModel>,
  sequence: u64,
}

/// 正在进行的推理，供看门狗检查
struct InFlight {
  ticket: u64,
  model: Arc<ActiveModel>,
  started: Instant,
}

struct Core {
  config: PipelineConfig,
  gate: FrameGate,
  slot: ModelSlot,
  preprocessor: FramePreprocessor,
  invoker: InferenceInvoker,
  events: Sender<UiEvent>,
  stats: PipelineStats,
  sequence: AtomicU64,
  in_flight: Mutex<Option<InFlight>>,
  jobs: Mutex<Option<Sender<Job>>>,
  worker: Mutex<Option<JoinHandle<()>>>,
  shutdown: AtomicBool,
}

impl Core {
  /// 启动新的推理线程并替换任务通道，旧线程在其通道关闭后自行退出
  fn spawn_worker(self: &Arc<Self>) -> std::io::Result<()> {
    let (tx, rx) = crossbeam_channel::bounded::<Job>(1);
    let core = self.clone();
    let handle = thread::Builder::new()
      .name("tanjing-inference".into())
      .spawn(move || core.worker_loop(rx))?;

    *self.jobs.lock() = Some(tx);
    if self.worker.lock().replace(handle).is_some() {
      debug!("旧推理线程已脱离");
    }
    Ok(())
  }

  fn worker_loop(&self, jobs: Receiver<Job>) {
    debug!("推理线程启动");
    for job in jobs {
      let sequence = job.sequence;
      if panic::catch_unwind(AssertUnwindSafe(|| self.process_job(job))).is_err() {
        error!("处理第 {} 帧时发生崩溃", sequence);
      }
    }
    debug!("推理线程退出");
  }

  fn process_job(&self, job: Job) -> FrameOutcome {
    let Job {
      frame,
      permit,
      model,
      sequence,
    } = job;
    let outcome = self.process_admitted(&frame.as_frame(), &permit, &model, sequence);
    permit.release();
    outcome
  }

  fn admit(&self, frame: &Frame<'_>) -> FrameAdmission {
    if self.shutdown.load(Ordering::Acquire) {
      return FrameAdmission::Dropped(DropReason::WorkerUnavailable);
    }

    let Some(permit) = self.gate.try_enter() else {
      bump(&self.stats.rejected_busy);
      debug!("准入门被占用，丢弃帧");
      return FrameAdmission::Dropped(DropReason::GateBusy);
    };
    let Some(model) = self.slot.ready_snapshot() else {
      bump(&self.stats.not_ready);
      debug!("模型未就绪，丢弃帧");
      return FrameAdmission::Dropped(DropReason::NotReady);
    };

    let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
    let job = Job {
      frame: frame.to_owned_frame(),
      permit,
      model,
      sequence,
    };

    let jobs = self.jobs.lock();
    let sent = match jobs.as_ref() {
      Some(tx) => tx.try_send(job).map_err(|e| match e {
        TrySendError::Full(_) => "推理通道已满",
        TrySendError::Disconnected(_) => "推理线程已退出",
      }),
      None => Err("推理线程已关闭"),
    };
    drop(jobs);

    match sent {
      Ok(()) => {
        bump(&self.stats.admitted);
        FrameAdmission::Admitted { sequence }
      }
      Err(reason) => {
        bump(&self.stats.worker_unavailable);
        warn!("第 {} 帧无法交给推理线程: {}", sequence, reason);
        FrameAdmission::Dropped(DropReason::WorkerUnavailable)
      }
    }
  }

  fn process_admitted(
    &self,
    frame: &Frame<'_>,
    permit: &GatePermit,
    model: &Arc<ActiveModel>,
    sequence: u64,
  ) -> FrameOutcome {
    let prepared = match self.preprocessor.prepare(frame, model.input_size()) {
      Ok(prepared) => prepared,
      Err(e) => {
        bump(&self.stats.conversion_failed);
        warn!("第 {} 帧转换失败，丢弃: {}", sequence, e);
        return FrameOutcome::ConversionFailed(e);
      }
    };

    // 超时只计算引擎调用本身
    *self.in_flight.lock() = Some(InFlight {
      ticket: permit.ticket(),
      model: model.clone(),
      started: Instant::now(),
    });
    let result = self.invoker.infer(model, &prepared);
    self.clear_in_flight(permit.ticket());

    if permit.is_revoked() {
      bump(&self.stats.discarded);
      debug!("第 {} 帧的推理已被收回，丢弃结果", sequence);
      return FrameOutcome::Revoked;
    }

    match result {
      Ok(inference) => {
        let fps = inference.fps();
        let result = FrameResult {
          sequence,
          model_id: model.id().to_string(),
          detections: inference.detections,
          elapsed: inference.elapsed,
          fps,
          source_width: frame.width,
          source_height: frame.height,
        };
        if self.events.send(UiEvent::Frame(result.clone())).is_err() {
          debug!("界面循环已关闭");
        }
        bump(&self.stats.published);
        FrameOutcome::Published(result)
      }
      Err(e) => {
        bump(&self.stats.inference_failed);
        self.fail_model(model, &e.to_string());
        FrameOutcome::InferenceFailed(e)
      }
    }
  }

  /// 将出错的模型快照标记为不可用，每个模型只通知一次
  fn fail_model(&self, model: &ActiveModel, message: &str) {
    if !model.mark_unready() {
      return;
    }
    error!("模型 {} 已停止推理: {}", model.id(), message);
    bump(&self.stats.failure_notifications);
    let event = UiEvent::Failure {
      model_id: model.id().to_string(),
      message: message.to_string(),
    };
    if self.events.send(event).is_err() {
      debug!("界面循环已关闭");
    }
  }

  fn clear_in_flight(&self, ticket: u64) {
    let mut in_flight = self.in_flight.lock();
    if in_flight.as_ref().is_some_and(|f| f.ticket == ticket) {
      *in_flight = None;
    }
  }

  /// 检查推理是否超时，超时则收回许可并换一个推理线程
  fn check_stalled(self: &Arc<Self>, timeout: Duration) -> bool {
    let stalled = match self.in_flight.lock().as_ref() {
      Some(f) if f.started.elapsed() >= timeout => Some((f.ticket, f.model.clone())),
      _ => None,
    };
    let Some((ticket, model)) = stalled else {
      return false;
    };

    if !self.gate.revoke(ticket) {
      return false;
    }
    self.clear_in_flight(ticket);
    bump(&self.stats.watchdog_trips);
    warn!("模型 {} 推理超过 {:?}，收回许可 #{}", model.id(), timeout, ticket);

    self.fail_model(&model, &format!("推理超时 ({:?})", timeout));
    if self.shutdown.load(Ordering::Acquire) {
      return true;
    }
    if let Err(e) = self.spawn_worker() {
      error!("无法重新启动推理线程: {}", e);
      self.jobs.lock().take();
    }
    true
  }
}

/// 交给来源回调的句柄，可在任意线程上调用
#[derive(Clone)]
pub struct FrameSink {
  core: Arc<Core>,
}

impl FrameSink {
  pub fn on_frame(&self, frame: &Frame<'_>) -> FrameAdmission {
    self.core.admit(frame)
  }
}

pub struct Pipeline {
  core: Arc<Core>,
  events: Receiver<UiEvent>,
  source: Mutex<Option<SourceHandle>>,
  watchdog: Mutex<Option<Watchdog>>,
}

impl Pipeline {
  pub fn new(
    config: PipelineConfig,
    catalog: Arc<dyn ModelCatalog>,
    loader: Arc<dyn ModelLoader>,
  ) -> Result<Self, PipelineError> {
    if config.input_size == 0 {
      return Err(PipelineError::InvalidConfig("模型输入尺寸不能为零".into()));
    }
    if config.inference_timeout_ms == Some(0) {
      return Err(PipelineError::InvalidConfig("推理超时不能为零".into()));
    }
    let threshold = config.probability_threshold;
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
      return Err(PipelineError::InvalidConfig(format!(
        "置信度阈值 {} 不在 [0, 1] 内",
        threshold
      )));
    }

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let core = Arc::new(Core {
      gate: FrameGate::new(),
      slot: ModelSlot::new(catalog, loader, config.input_size),
      preprocessor: FramePreprocessor::new(config.channel_order),
      invoker: InferenceInvoker::new(),
      events: events_tx,
      stats: PipelineStats::default(),
      sequence: AtomicU64::new(0),
      in_flight: Mutex::new(None),
      jobs: Mutex::new(None),
      worker: Mutex::new(None),
      shutdown: AtomicBool::new(false),
      config,
    });
    core.spawn_worker()?;

    let watchdog = match core.config.inference_timeout() {
      Some(timeout) => Some(Watchdog::spawn(
        core.clone(),
        timeout,
        core.config.watchdog_interval(),
      )?),
      None => None,
    };

    info!(
      "流水线就绪，输入尺寸 {}，阈值 {}，通道顺序 {:?}",
      core.config.input_size, core.config.probability_threshold, core.config.channel_order
    );

    Ok(Self {
      core,
      events: events_rx,
      source: Mutex::new(None),
      watchdog: Mutex::new(watchdog),
    })
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.core.config
  }

  pub fn slot(&self) -> &ModelSlot {
    &self.core.slot
  }

  pub fn gate(&self) -> &FrameGate {
    &self.core.gate
  }

  pub fn events(&self) -> Receiver<UiEvent> {
    self.events.clone()
  }

  pub fn ui_loop<V: Visualizer>(&self, visualizer: V) -> UiLoop<V> {
    UiLoop::new(self.events(), visualizer)
  }

  pub fn sink(&self) -> FrameSink {
    FrameSink {
      core: self.core.clone(),
    }
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.core.stats.snapshot()
  }

  /// 来源回调入口，只做有界的工作，不会阻塞在推理上
  pub fn on_frame_arrived(&self, frame: &Frame<'_>) -> FrameAdmission {
    self.core.admit(frame)
  }

  /// 在调用线程上同步处理一帧，与 [`Pipeline::on_frame_arrived`] 共享准入门与模型
  pub fn process_frame(&self, frame: &Frame<'_>) -> FrameOutcome {
    let core = &self.core;
    let Some(permit) = core.gate.try_enter() else {
      bump(&core.stats.rejected_busy);
      return FrameOutcome::Dropped(DropReason::GateBusy);
    };
    let Some(model) = core.slot.ready_snapshot() else {
      bump(&core.stats.not_ready);
      return FrameOutcome::Dropped(DropReason::NotReady);
    };

    let sequence = core.sequence.fetch_add(1, Ordering::Relaxed) + 1;
    bump(&core.stats.admitted);
    let outcome = core.process_admitted(frame, &permit, &model, sequence);
    permit.release();
    outcome
  }

  /// 切换模型
  ///
  /// 加载期间到达的帧被丢弃；加载失败时保留原模型及其就绪状态。
  pub fn select_model(&self, descriptor: &ModelDescriptor) -> Result<(), LoadError> {
    let _selection = self.core.slot.begin_selection();
    let model = self.core.slot.load(
      descriptor,
      descriptor.labels.clone(),
      self.core.config.probability_threshold,
    )?;
    info!("已切换到模型 {}，{}", model.id(), model.labels().summary());
    Ok(())
  }

  /// 注册帧来源，来源只能注册一次，失败不会重试
  pub fn attach<S: FrameSource>(&self, source: S) -> Result<(), RegistrationError> {
    let mut attached = self.source.lock();
    if attached.is_some() {
      return Err(RegistrationError::AlreadyAttached);
    }

    let sink = self.sink();
    let handle = source
      .start(Box::new(move |frame: &Frame<'_>| {
        sink.on_frame(frame);
      }))
      .map_err(|e| {
        error!("来源注册失败: {}", e);
        e
      })?;
    info!("来源 {} 已注册", handle.name());
    *attached = Some(handle);
    Ok(())
  }

  /// 来源是否已经停止推送
  pub fn source_finished(&self) -> bool {
    self.source.lock().as_ref().is_none_or(|s| s.is_finished())
  }

  /// 停止来源与后台线程，可以重复调用
  pub fn shutdown(&self) {
    if self.core.shutdown.swap(true, Ordering::AcqRel) {
      return;
    }
    info!("关闭流水线");

    if let Some(mut source) = self.source.lock().take() {
      source.stop();
    }
    if let Some(mut watchdog) = self.watchdog.lock().take() {
      watchdog.stop();
    }
    self.core.jobs.lock().take();
    let worker = self.core.worker.lock().take();
    if let Some(worker) = worker {
      let deadline = Instant::now() + WORKER_JOIN_TIMEOUT;
      while !worker.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
      }
      if !worker.is_finished() {
        warn!(
          "推理线程在 {:?} 内没有退出，放弃等待",
          WORKER_JOIN_TIMEOUT
        );
      } else if worker.join().is_err() {
        warn!("推理线程异常退出");
      }
    }
  }
}

impl Drop for Pipeline {
  fn drop(&mut self) {
    self.shutdown();
  }
}
