// 该文件是 Tianhui （天绘） 项目的一部分。
// src/config.rs - 流水线配置
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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::feature::DEFAULT_DEDUP_OVERLAP;
use crate::geo::RasterWindow;
use crate::label::Color;
use crate::model::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::tile::{Normalization, check_tiling};
use crate::vectorize::{DEFAULT_MIN_AREA, VectorizeOptions};

pub const DEFAULT_TILE_SIZE: usize = 256;
pub const DEFAULT_OVERLAP: usize = 32;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置 JSON 无效: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("配置项 {0} 无效: {1}")]
  Invalid(&'static str, String),
}

/// 所有字段都有默认值，配置文件只需写需要覆盖的部分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub tile_size: usize,
  pub overlap: usize,
  pub confidence_threshold: f32,
  /// 像素²
  pub min_mask_area: f64,
  pub dedup_overlap: f64,
  pub inference_timeout_ms: Option<u64>,
  pub normalization: Option<Normalization>,
  pub default_color: Color,
  /// 未给出地理范围时使用的窗口；缺省为整幅栅格
  pub default_window: Option<RasterWindow>,
  /// 任一块推理失败后不再发出新的块
  pub abort_on_tile_error: bool,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      tile_size: DEFAULT_TILE_SIZE,
      overlap: DEFAULT_OVERLAP,
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      min_mask_area: DEFAULT_MIN_AREA,
      dedup_overlap: DEFAULT_DEDUP_OVERLAP,
      inference_timeout_ms: None,
      normalization: None,
      default_color: Color::default(),
      default_window: None,
      abort_on_tile_error: false,
    }
  }
}

impl PipelineConfig {
  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let json = std::fs::read_to_string(path.as_ref())?;
    let config: PipelineConfig = serde_json::from_str(&json)?;
    config.validate()?;
    info!("读取配置 {}", path.as_ref().display());
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    check_tiling(self.tile_size, self.overlap)
      .map_err(|e| ConfigError::Invalid("tile_size/overlap", e.to_string()))?;
    if !(0.0..=1.0).contains(&self.confidence_threshold) {
      return Err(ConfigError::Invalid(
        "confidence_threshold",
        self.confidence_threshold.to_string(),
      ));
    }
    if !self.min_mask_area.is_finite() || self.min_mask_area < 0.0 {
      return Err(ConfigError::Invalid("min_mask_area", self.min_mask_area.to_string()));
    }
    if !(0.0..=1.0).contains(&self.dedup_overlap) {
      return Err(ConfigError::Invalid("dedup_overlap", self.dedup_overlap.to_string()));
    }
    if self.inference_timeout_ms == Some(0) {
      return Err(ConfigError::Invalid("inference_timeout_ms", "0".to_string()));
    }
    Ok(())
  }

  pub fn inference_timeout(&self) -> Option<Duration> {
    self.inference_timeout_ms.map(Duration::from_millis)
  }

  pub fn vectorize_options(&self) -> VectorizeOptions {
    VectorizeOptions {
      min_area: self.min_mask_area,
    }
  }
}
