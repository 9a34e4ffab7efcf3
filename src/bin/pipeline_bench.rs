// 该文件是 Tanjing （探镜） 项目的一部分。
// src/bin/pipeline_bench.rs - 流水线压测
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

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use tanjing::{
  FromUrl,
  catalog::{JsonModelCatalog, ModelCatalog},
  config::PipelineConfig,
  engine::ReplayLoader,
  input::InputWrapper,
  output::OutputWrapper,
  pipeline::Pipeline,
  task::{LiveTask, Task},
};

/// Tanjing 流水线压测参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 内置模型目录，包含 models.json
  #[arg(long, value_name = "DIR")]
  pub models: PathBuf,
  /// 用户导入的模型目录
  #[arg(long, value_name = "DIR")]
  pub user_models: Option<PathBuf>,
  /// 预选模型 id，不存在时使用第一个模型
  #[arg(long, value_name = "ID")]
  pub model: Option<String>,
  /// 输入来源，如 synthetic://640x480?fps=30 或 folder:///path?fps=10
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出，如 log:// 或 folder:///path?always
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
  /// 流水线配置，如 pipeline:///?input_size=416&threshold=0.6&timeout_ms=500
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<Url>,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<u64>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型目录: {}", args.models.display());
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let config = match &args.config {
    Some(url) => PipelineConfig::from_url(url)?,
    None => PipelineConfig::default(),
  };
  let user_models = args
    .user_models
    .clone()
    .unwrap_or_else(|| args.models.join("user"));
  let catalog = Arc::new(JsonModelCatalog::new(&args.models, user_models));

  let descriptor = catalog
    .default_selection(args.model.as_deref())?
    .ok_or_else(|| anyhow::anyhow!("模型目录中没有可用模型"))?;

  let pipeline = Pipeline::new(config, catalog, Arc::new(ReplayLoader::new()))?;
  pipeline.select_model(&descriptor)?;

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  LiveTask::default()
    .with_frame_number(args.frame_number)
    .run_task(input, &pipeline, output)?;

  let stats = pipeline.stats();
  println!("{}", serde_json::to_string_pretty(&stats)?);

  Ok(())
}
