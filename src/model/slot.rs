// 该文件是 Tanjing （探镜） 项目的一部分。
// src/model/slot.rs - 可热切换的模型槽
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

use std::sync::{
  Arc,
  atomic::{AtomicU64, AtomicUsize, Ordering},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
  catalog::{ModelCatalog, ModelDescriptor},
  model::{ActiveModel, LabelSet, LoadError, ModelLoader},
};

/// 持有当前生效的模型
///
/// 读者拿到的是完整构建好的 [`ActiveModel`] 快照，读锁只在复制指针时持有，
/// 不会跨越推理调用。
pub struct ModelSlot {
  current: RwLock<Option<Arc<ActiveModel>>>,
  catalog: Arc<dyn ModelCatalog>,
  loader: Arc<dyn ModelLoader>,
  input_size: u32,
  load_lock: Mutex<()>,
  selecting: AtomicUsize,
  generation: AtomicU64,
}

impl ModelSlot {
  pub fn new(
    catalog: Arc<dyn ModelCatalog>,
    loader: Arc<dyn ModelLoader>,
    input_size: u32,
  ) -> Self {
    Self {
      current: RwLock::new(None),
      catalog,
      loader,
      input_size,
      load_lock: Mutex::new(()),
      selecting: AtomicUsize::new(0),
      generation: AtomicU64::new(0),
    }
  }

  pub fn catalog(&self) -> &Arc<dyn ModelCatalog> {
    &self.catalog
  }

  /// 加载模型并原子地发布
  ///
  /// 加载期间旧模型保持发布状态；失败时旧模型原样保留，首次加载失败则槽保持为空。
  pub fn load(
    &self,
    descriptor: &ModelDescriptor,
    labels: LabelSet,
    threshold: f32,
  ) -> Result<Arc<ActiveModel>, LoadError> {
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
      return Err(LoadError::InvalidThreshold(threshold));
    }
    if self.input_size == 0 {
      return Err(LoadError::InvalidInputSize(self.input_size));
    }

    let _load = self.load_lock.lock();
    info!("加载模型: {} ({})", descriptor.display_name, descriptor.id);

    let weights = self.catalog.resolve_weights(descriptor).map_err(|e| {
      error!("无法定位模型 {} 的权重: {}", descriptor.id, e);
      LoadError::from(e)
    })?;
    debug!("模型权重: {}", weights);

    let engine = self.loader.load(descriptor, &weights).map_err(|e| {
      error!("模型 {} 加载失败: {}", descriptor.id, e);
      e
    })?;

    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
    let model = Arc::new(ActiveModel::new(
      descriptor.clone(),
      engine,
      labels,
      threshold,
      self.input_size,
      generation,
    ));

    let previous = self.current.write().replace(model.clone());
    if let Some(previous) = previous {
      debug!(
        "替换模型 {} (#{}) -> {} (#{})",
        previous.id(),
        previous.generation(),
        model.id(),
        generation
      );
    }
    info!("模型加载完成: {} (#{})", model.id(), generation);

    Ok(model)
  }

  /// 当前模型快照，不受之后的加载影响
  pub fn current(&self) -> Option<Arc<ActiveModel>> {
    self.current.read().clone()
  }

  /// 仅当没有进行中的切换且当前模型就绪时返回快照
  pub fn ready_snapshot(&self) -> Option<Arc<ActiveModel>> {
    if self.is_selecting() {
      return None;
    }
    self.current().filter(|model| model.is_ready())
  }

  pub fn is_ready(&self) -> bool {
    self.ready_snapshot().is_some()
  }

  pub fn is_selecting(&self) -> bool {
    self.selecting.load(Ordering::Acquire) > 0
  }

  /// 将当前模型标记为不可用，直到下一次成功加载
  pub fn mark_unready(&self) -> bool {
    match self.current() {
      Some(model) => {
        let flipped = model.mark_unready();
        if flipped {
          warn!("模型 {} (#{}) 已标记为不可用", model.id(), model.generation());
        }
        flipped
      }
      None => false,
    }
  }

  /// 进入模型切换窗口，守卫存活期间槽视为未就绪
  pub fn begin_selection(&self) -> SelectionGuard<'_> {
    self.selecting.fetch_add(1, Ordering::AcqRel);
    SelectionGuard { slot: self }
  }
}

/// 模型切换窗口守卫
#[must_use]
pub struct SelectionGuard<'a> {
  slot: &'a ModelSlot,
}

impl Drop for SelectionGuard<'_> {
  fn drop(&mut self) {
    self.slot.selecting.fetch_sub(1, Ordering::AcqRel);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    catalog::{CatalogError, WeightsLocator},
    frame::PreparedFrame,
    inference::InferenceError,
    model::{Detection, InferenceEngine},
  };
  use std::{path::PathBuf, sync::Barrier, thread};

  struct MemoryCatalog;

  impl ModelCatalog for MemoryCatalog {
    fn list_built_in(&self) -> Result<Vec<ModelDescriptor>, CatalogError> {
      Ok(Vec::new())
    }

    fn list_user_imported(&self) -> Result<Vec<ModelDescriptor>, CatalogError> {
      Ok(Vec::new())
    }

    fn save(&self, _models: &[ModelDescriptor]) -> Result<(), CatalogError> {
      Ok(())
    }

    fn delete(&self, _descriptor: &ModelDescriptor) -> Result<(), CatalogError> {
      Ok(())
    }

    fn resolve_weights(&self, descriptor: &ModelDescriptor) -> Result<WeightsLocator, CatalogError> {
      if descriptor.file_name == "missing" {
        return Err(CatalogError::WeightsNotFound(PathBuf::from("missing")));
      }
      Ok(WeightsLocator::new(PathBuf::from(&descriptor.file_name)))
    }
  }

  /// 每个引擎记住自己加载时的模型编号
  struct TaggedEngine(String);

  impl InferenceEngine for TaggedEngine {
    fn predict(&self, _input: &PreparedFrame) -> Result<Vec<Detection>, InferenceError> {
      Ok(vec![Detection::new(
        self.0.clone(),
        1.0,
        Default::default(),
      )])
    }
  }

  struct TaggedLoader;

  impl ModelLoader for TaggedLoader {
    fn load(
      &self,
      descriptor: &ModelDescriptor,
      _weights: &WeightsLocator,
    ) -> Result<Arc<dyn InferenceEngine>, LoadError> {
      if descriptor.id == "broken" {
        return Err(LoadError::Engine {
          model: descriptor.id.clone(),
          reason: "bad weights".into(),
        });
      }
      Ok(Arc::new(TaggedEngine(descriptor.id.clone())))
    }
  }

  fn descriptor(id: &str, file_name: &str) -> ModelDescriptor {
    ModelDescriptor {
      id: id.into(),
      display_name: id.to_uppercase(),
      labels: LabelSet::new([format!("{id}-label")]),
      built_in: true,
      file_name: file_name.into(),
    }
  }

  fn slot() -> ModelSlot {
    ModelSlot::new(Arc::new(MemoryCatalog), Arc::new(TaggedLoader), 416)
  }

  fn load(slot: &ModelSlot, d: &ModelDescriptor) -> Result<Arc<ActiveModel>, LoadError> {
    slot.load(d, d.labels.clone(), 0.6)
  }

  #[test]
  fn first_load_failure_leaves_slot_empty() {
    let slot = slot();
    assert!(load(&slot, &descriptor("broken", "w.bin")).is_err());
    assert!(slot.current().is_none());
    assert!(!slot.is_ready());
    assert!(matches!(
      load(&slot, &descriptor("a", "missing")),
      Err(LoadError::Catalog(CatalogError::WeightsNotFound(_)))
    ));
  }

  #[test]
  fn failed_load_keeps_previous_model() {
    let slot = slot();
    let first = load(&slot, &descriptor("a", "a.bin")).unwrap();
    assert!(load(&slot, &descriptor("broken", "b.bin")).is_err());

    let current = slot.current().unwrap();
    assert!(Arc::ptr_eq(&first, &current));
    assert!(current.is_ready());
  }

  #[test]
  fn snapshot_survives_swap() {
    let slot = slot();
    let old = load(&slot, &descriptor("a", "a.bin")).unwrap();
    let snapshot = slot.current().unwrap();
    let new = load(&slot, &descriptor("b", "b.bin")).unwrap();

    assert_eq!(snapshot.id(), "a");
    assert!(Arc::ptr_eq(&snapshot, &old));
    assert_eq!(slot.current().unwrap().id(), "b");
    assert!(new.generation() > old.generation());
  }

  #[test]
  fn invalid_threshold_rejected() {
    let slot = slot();
    let d = descriptor("a", "a.bin");
    assert!(matches!(
      slot.load(&d, d.labels.clone(), 1.5),
      Err(LoadError::InvalidThreshold(_))
    ));
    assert!(matches!(
      slot.load(&d, d.labels.clone(), f32::NAN),
      Err(LoadError::InvalidThreshold(_))
    ));
  }

  #[test]
  fn mark_unready_until_next_load() {
    let slot = slot();
    assert!(!slot.mark_unready());
    load(&slot, &descriptor("a", "a.bin")).unwrap();
    assert!(slot.mark_unready());
    assert!(!slot.mark_unready());
    assert!(!slot.is_ready());
    load(&slot, &descriptor("a", "a.bin")).unwrap();
    assert!(slot.is_ready());
  }

  #[test]
  fn selection_window_is_not_ready() {
    let slot = slot();
    load(&slot, &descriptor("a", "a.bin")).unwrap();
    {
      let _selection = slot.begin_selection();
      assert!(slot.is_selecting());
      assert!(slot.ready_snapshot().is_none());
      // 切换窗口内旧模型仍然可以被已有的推理使用
      assert!(slot.current().unwrap().is_ready());
    }
    assert!(slot.is_ready());
  }

  #[test]
  fn concurrent_reads_never_mix_models() {
    let slot = Arc::new(slot());
    load(&slot, &descriptor("a", "a.bin")).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let reader = {
      let slot = slot.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        let input = PreparedFrame::from_parts(1, Default::default(), vec![0; 3]);
        barrier.wait();
        for _ in 0..10_000 {
          let model = slot.current().unwrap();
          // 引擎、标签与描述必须来自同一次加载
          let label = model.labels().iter().next().unwrap().to_string();
          assert_eq!(label, format!("{}-label", model.id()));
          let tagged = model.engine().predict(&input).unwrap();
          assert_eq!(tagged[0].tag_name, model.id());
        }
      })
    };

    barrier.wait();
    for i in 0..200 {
      let id = if i % 2 == 0 { "b" } else { "a" };
      load(&slot, &descriptor(id, "w.bin")).unwrap();
    }
    reader.join().unwrap();
  }
}
