// 该文件是 Tanjing （探镜） 项目的一部分。
// src/catalog.rs - 模型目录
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

//! # 模型目录
//!
//! 内置模型与用户导入的模型分别放在两个目录中，每个目录下有一个
//! `models.json` 清单，列出该目录中的模型描述。内置目录只读。

use std::{
  fmt,
  fs,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::LabelSet;

pub const MANIFEST_FILE: &str = "models.json";

#[derive(Error, Debug)]
pub enum CatalogError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型清单格式错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("内置模型不可删除: {0}")]
  BuiltInModel(String),
  #[error("未找到模型: {0}")]
  NotFound(String),
  #[error("模型权重文件不存在: {0}")]
  WeightsNotFound(PathBuf),
  #[error("无效的模型文件名: {0}")]
  InvalidFileName(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
  pub id: String,
  #[serde(default)]
  pub display_name: String,
  #[serde(default)]
  pub labels: LabelSet,
  #[serde(default, skip_serializing)]
  pub built_in: bool,
  pub file_name: String,
}

impl ModelDescriptor {
  pub fn name(&self) -> &str {
    if self.display_name.is_empty() {
      &self.id
    } else {
      &self.display_name
    }
  }
}

/// 解析后的模型权重位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightsLocator(PathBuf);

impl WeightsLocator {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self(path.into())
  }

  pub fn path(&self) -> &Path {
    &self.0
  }
}

impl fmt::Display for WeightsLocator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.display())
  }
}

pub trait ModelCatalog: Send + Sync {
  fn list_built_in(&self) -> Result<Vec<ModelDescriptor>, CatalogError>;
  fn list_user_imported(&self) -> Result<Vec<ModelDescriptor>, CatalogError>;
  /// 覆盖保存用户导入的模型列表
  fn save(&self, models: &[ModelDescriptor]) -> Result<(), CatalogError>;
  fn delete(&self, descriptor: &ModelDescriptor) -> Result<(), CatalogError>;
  fn resolve_weights(&self, descriptor: &ModelDescriptor) -> Result<WeightsLocator, CatalogError>;

  /// 内置模型在前
  fn all(&self) -> Result<Vec<ModelDescriptor>, CatalogError> {
    let mut models = self.list_built_in()?;
    models.extend(self.list_user_imported()?);
    Ok(models)
  }

  /// 预选模型存在时返回它，否则返回第一个
  fn default_selection(
    &self,
    preselected: Option<&str>,
  ) -> Result<Option<ModelDescriptor>, CatalogError> {
    let models = self.all()?;
    if let Some(id) = preselected {
      if let Some(found) = models.iter().find(|m| m.id == id) {
        return Ok(Some(found.clone()));
      }
      warn!("预选模型 {} 不存在，使用第一个模型", id);
    }
    Ok(models.into_iter().next())
  }
}

/// 基于目录与 JSON 清单的模型目录
#[derive(Debug, Clone)]
pub struct JsonModelCatalog {
  built_in_dir: PathBuf,
  user_dir: PathBuf,
}

impl JsonModelCatalog {
  pub fn new(built_in_dir: impl Into<PathBuf>, user_dir: impl Into<PathBuf>) -> Self {
    Self {
      built_in_dir: built_in_dir.into(),
      user_dir: user_dir.into(),
    }
  }

  pub fn built_in_dir(&self) -> &Path {
    &self.built_in_dir
  }

  pub fn user_dir(&self) -> &Path {
    &self.user_dir
  }

  /// 将权重文件复制到用户目录并加入清单，同 id 的旧条目被替换
  pub fn import(
    &self,
    mut descriptor: ModelDescriptor,
    weights: &Path,
  ) -> Result<ModelDescriptor, CatalogError> {
    let file_name = weights
      .file_name()
      .and_then(|n| n.to_str())
      .ok_or_else(|| CatalogError::InvalidFileName(weights.display().to_string()))?
      .to_string();
    if !weights.is_file() {
      return Err(CatalogError::WeightsNotFound(weights.to_path_buf()));
    }

    fs::create_dir_all(&self.user_dir)?;
    fs::copy(weights, self.user_dir.join(&file_name))?;

    descriptor.file_name = file_name;
    descriptor.built_in = false;

    let mut models = self.list_user_imported()?;
    models.retain(|m| m.id != descriptor.id);
    models.push(descriptor.clone());
    self.save(&models)?;

    info!("导入模型: {} ({})", descriptor.name(), descriptor.id);
    Ok(descriptor)
  }

  fn read_manifest(dir: &Path, built_in: bool) -> Result<Vec<ModelDescriptor>, CatalogError> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() {
      debug!("模型清单不存在: {}", path.display());
      return Ok(Vec::new());
    }

    let text = fs::read_to_string(&path)?;
    let mut models: Vec<ModelDescriptor> = serde_json::from_str(&text)?;
    for model in models.iter_mut() {
      model.built_in = built_in;
    }
    Ok(models)
  }
}

/// 文件名只能是单个路径分量
fn checked_file_name(name: &str) -> Result<&Path, CatalogError> {
  let path = Path::new(name);
  let mut components = path.components();
  match (components.next(), components.next()) {
    (Some(std::path::Component::Normal(_)), None) => Ok(path),
    _ => Err(CatalogError::InvalidFileName(name.to_string())),
  }
}

impl ModelCatalog for JsonModelCatalog {
  fn list_built_in(&self) -> Result<Vec<ModelDescriptor>, CatalogError> {
    Self::read_manifest(&self.built_in_dir, true)
  }

  fn list_user_imported(&self) -> Result<Vec<ModelDescriptor>, CatalogError> {
    Self::read_manifest(&self.user_dir, false)
  }

  fn save(&self, models: &[ModelDescriptor]) -> Result<(), CatalogError> {
    fs::create_dir_all(&self.user_dir)?;
    let user: Vec<&ModelDescriptor> = models.iter().filter(|m| !m.built_in).collect();
    let text = serde_json::to_string_pretty(&user)?;
    fs::write(self.user_dir.join(MANIFEST_FILE), text)?;
    debug!("保存 {} 个用户模型", user.len());
    Ok(())
  }

  fn delete(&self, descriptor: &ModelDescriptor) -> Result<(), CatalogError> {
    if descriptor.built_in {
      return Err(CatalogError::BuiltInModel(descriptor.id.clone()));
    }

    let mut models = self.list_user_imported()?;
    let before = models.len();
    models.retain(|m| m.id != descriptor.id);
    if models.len() == before {
      return Err(CatalogError::NotFound(descriptor.id.clone()));
    }

    let weights = self.user_dir.join(checked_file_name(&descriptor.file_name)?);
    match fs::remove_file(&weights) {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        warn!("模型权重文件已不存在: {}", weights.display());
      }
      Err(e) => return Err(e.into()),
    }

    self.save(&models)?;
    info!("删除模型: {} ({})", descriptor.name(), descriptor.id);
    Ok(())
  }

  fn resolve_weights(&self, descriptor: &ModelDescriptor) -> Result<WeightsLocator, CatalogError> {
    let dir = if descriptor.built_in {
      &self.built_in_dir
    } else {
      &self.user_dir
    };
    let path = dir.join(checked_file_name(&descriptor.file_name)?);
    if !path.is_file() {
      return Err(CatalogError::WeightsNotFound(path));
    }
    Ok(WeightsLocator::new(path))
  }
}
