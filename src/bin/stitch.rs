// 该文件是 Tianhui （天绘） 项目的一部分。
// src/bin/stitch.rs - 稠密预测拼接
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
  model::ModelWrapper,
  pipeline::Pipeline,
  raster::{ImageFileRaster, is_tiff, save_gray_png, write_geotiff},
};

/// 天绘：逐块稠密预测，拼接为 GeoTIFF（或带 World 文件的 PNG）
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 栅格来源，例如 raster:///data/site.png
  #[arg(long, value_name = "SOURCE")]
  pub raster: Url,
  /// 模型，例如 threshold://?band=0
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 地理范围 min_x,min_y,max_x,max_y；缺省为整幅栅格
  #[arg(long, value_name = "BOUNDS", allow_hyphen_values = true)]
  pub bounds: Option<GeoBounds>,
  /// 流水线配置 JSON 文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  #[arg(long, value_name = "PIXELS")]
  pub tile_size: Option<usize>,
  #[arg(long, value_name = "PIXELS")]
  pub overlap: Option<usize>,
  /// 输出路径；.tif/.tiff 写 32 位浮点 GeoTIFF，其余写 8 位 PNG + World 文件
  #[arg(long, value_name = "OUTPUT")]
  pub output: PathBuf,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();

  info!("栅格来源: {}", args.raster);
  info!("模型: {}", args.model);

  let mut config = match &args.config {
    Some(path) => PipelineConfig::from_json_file(path)?,
    None => PipelineConfig::default(),
  };
  if let Some(tile_size) = args.tile_size {
    config.tile_size = tile_size;
  }
  if let Some(overlap) = args.overlap {
    config.overlap = overlap;
  }

  let raster = ImageFileRaster::from_url(&args.raster)?.load()?;
  let model = ModelWrapper::from_url(&args.model)?;
  let pipeline = Pipeline::new(model, config)?;

  let stop = pipeline.stop_handle();
  ctrlc::set_handler(move || {
    info!("收到中断信号，不再发出新的块...");
    stop.store(true, Ordering::SeqCst);
  })?;

  let prediction = pipeline.predict_dense(&raster, args.bounds.as_ref())?;
  if !prediction.is_complete() {
    warn!(
      "结果不完整: 失败 {} 块, 跳过 {} 块",
      prediction.report.failures.len(),
      prediction.report.skipped.len()
    );
  }
  if is_tiff(&args.output) {
    write_geotiff(&prediction.values, &prediction.transform, &args.output)?;
  } else {
    save_gray_png(&prediction.values, &prediction.transform, &args.output)?;
  }

  Ok(())
}
