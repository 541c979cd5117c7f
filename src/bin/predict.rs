// 该文件是 Tianhui （天绘） 项目的一部分。
// src/bin/predict.rs - 范围预测与标注保存
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

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use tianhui::{
  FromUrl,
  config::PipelineConfig,
  geo::GeoBounds,
  label::{CategoryCatalog, DirectoryLabelStore, RasterRef, persist},
  model::ModelWrapper,
  pipeline::Pipeline,
  raster::ImageFileRaster,
};

/// 天绘：按地理范围分块推理并输出 GeoJSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 栅格来源，例如 raster:///data/site.png
  #[arg(long, value_name = "SOURCE")]
  pub raster: Url,
  /// 模型，例如 threshold://?band=0&level=0.5&category=1
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 类别表 JSON 文件
  #[arg(long, value_name = "FILE")]
  pub categories: PathBuf,
  /// 地理范围 min_x,min_y,max_x,max_y；缺省为整幅栅格
  #[arg(long, value_name = "BOUNDS", allow_hyphen_values = true)]
  pub bounds: Option<GeoBounds>,
  /// 流水线配置 JSON 文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub confidence: Option<f32>,
  #[arg(long, value_name = "PIXELS")]
  pub tile_size: Option<usize>,
  #[arg(long, value_name = "PIXELS")]
  pub overlap: Option<usize>,
  /// 单块推理超时（毫秒）
  #[arg(long, value_name = "MS")]
  pub timeout_ms: Option<u64>,
  /// GeoJSON 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: PathBuf,
  /// 标注存储，例如 folder:///data/labels
  #[arg(long, value_name = "STORE")]
  pub store: Option<Url>,
  #[arg(long, default_value = "0", value_name = "ID")]
  pub raster_id: u64,
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
  let mut config = match &args.config {
    Some(path) => PipelineConfig::from_json_file(path)?,
    None => PipelineConfig::default(),
  };
  if let Some(confidence) = args.confidence {
    config.confidence_threshold = confidence;
  }
  if let Some(tile_size) = args.tile_size {
    config.tile_size = tile_size;
  }
  if let Some(overlap) = args.overlap {
    config.overlap = overlap;
  }
  if args.timeout_ms.is_some() {
    config.inference_timeout_ms = args.timeout_ms;
  }
  config.validate()?;
  Ok(config)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();

  info!("栅格来源: {}", args.raster);
  info!("模型: {}", args.model);
  info!("输出路径: {}", args.output.display());

  let config = load_config(&args)?;
  let source = ImageFileRaster::from_url(&args.raster)?;
  let raster = source.load()?;
  let catalog = CategoryCatalog::from_json_file(&args.categories, config.default_color)?;
  let model = ModelWrapper::from_url(&args.model)?;
  let pipeline = Pipeline::new(model, config)?;

  let stop = pipeline.stop_handle();
  ctrlc::set_handler(move || {
    info!("收到中断信号，不再发出新的块...");
    stop.store(true, Ordering::SeqCst);
  })?;

  let prediction = pipeline.predict(&raster, args.bounds.as_ref(), &catalog)?;
  serde_json::to_writer_pretty(BufWriter::new(File::create(&args.output)?), &prediction.collection)?;
  info!(
    "写出 {} 个要素到 {}",
    prediction.collection.len(),
    args.output.display()
  );
  if !prediction.is_complete() {
    warn!(
      "结果不完整: 失败 {} 块, 跳过 {} 块",
      prediction.report.failures.len(),
      prediction.report.skipped.len()
    );
  }

  if let Some(store_url) = &args.store {
    let store = DirectoryLabelStore::from_url(store_url)?;
    let raster_ref = RasterRef {
      id: args.raster_id,
      name: source
        .path()
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default(),
    };
    let report = persist(&prediction.collection, &raster_ref, &catalog, &store);
    for failure in &report.failures {
      warn!("要素 {} 未保存: {}", failure.index, failure.reason());
    }
    info!("保存标注: {:?}", report.created);
  }

  Ok(())
}
