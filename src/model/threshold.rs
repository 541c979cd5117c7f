// 该文件是 Tianhui （天绘） 项目的一部分。
// src/model/threshold.rs - 波段阈值分割模型
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

use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use ndarray::{Array2, ArrayView3, Axis};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::model::{DenseModel, Detection, Model};
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum ThresholdModelError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("参数 {0} 无效: {1}")]
  InvalidParameter(String, String),
  #[error("波段索引越界: {band} (共 {channels} 个波段)")]
  BandOutOfRange { band: usize, channels: usize },
}

/// 对单个波段做阈值分割，每个八连通区域作为一个检测
///
/// 检测得分为区域内波段均值（截断到 [0, 1]）。
#[derive(Debug, Clone)]
pub struct ThresholdModel {
  band: usize,
  level: f32,
  category_id: u32,
  min_pixels: usize,
}

impl ThresholdModel {
  pub fn new(band: usize, level: f32, category_id: u32) -> Self {
    Self {
      band,
      level,
      category_id,
      min_pixels: 1,
    }
  }

  pub fn min_pixels(mut self, min_pixels: usize) -> Self {
    self.min_pixels = min_pixels.max(1);
    self
  }

  fn band_plane(&self, input: &ArrayView3<f32>) -> Result<Array2<f32>, ThresholdModelError> {
    let channels = input.dim().0;
    if self.band >= channels {
      error!("波段 {} 不存在, 输入共 {} 个波段", self.band, channels);
      return Err(ThresholdModelError::BandOutOfRange {
        band: self.band,
        channels,
      });
    }
    Ok(input.index_axis(Axis(0), self.band).to_owned())
  }
}

struct Region {
  min_col: usize,
  min_row: usize,
  max_col: usize,
  max_row: usize,
  pixels: usize,
  sum: f64,
}

impl Model for ThresholdModel {
  type Error = ThresholdModelError;

  fn infer(&self, input: &ArrayView3<f32>) -> Result<Vec<Detection>, Self::Error> {
    let plane = self.band_plane(input)?;
    let (height, width) = plane.dim();
    let binary = GrayImage::from_fn(width as u32, height as u32, |x, y| {
      if plane[[y as usize, x as usize]] > self.level {
        Luma([255u8])
      } else {
        Luma([0u8])
      }
    });
    let labels = connected_components(&binary, Connectivity::Eight, Luma([0u8]));

    let mut regions: Vec<Option<Region>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
      let label = label[0] as usize;
      if label == 0 {
        continue;
      }
      if regions.len() < label {
        regions.resize_with(label, || None);
      }
      let (col, row) = (x as usize, y as usize);
      let value = plane[[row, col]] as f64;
      let region = regions[label - 1].get_or_insert(Region {
        min_col: col,
        min_row: row,
        max_col: col,
        max_row: row,
        pixels: 0,
        sum: 0.0,
      });
      region.min_col = region.min_col.min(col);
      region.min_row = region.min_row.min(row);
      region.max_col = region.max_col.max(col);
      region.max_row = region.max_row.max(row);
      region.pixels += 1;
      region.sum += value;
    }

    let mut detections = Vec::new();
    for (index, region) in regions.iter().enumerate() {
      let Some(region) = region else { continue };
      if region.pixels < self.min_pixels {
        continue;
      }
      let label = (index + 1) as u32;
      let mask = Array2::from_shape_fn((height, width), |(r, c)| {
        labels.get_pixel(c as u32, r as u32)[0] == label
      });
      let score = (region.sum / region.pixels as f64).clamp(0.0, 1.0) as f32;
      detections.push(Detection::with_tile_mask(
        [
          region.min_col as f32,
          region.min_row as f32,
          (region.max_col + 1) as f32,
          (region.max_row + 1) as f32,
        ],
        score,
        self.category_id,
        mask,
      ));
    }
    debug!("阈值分割得到 {} 个区域", detections.len());
    Ok(detections)
  }
}

impl DenseModel for ThresholdModel {
  type Error = ThresholdModelError;

  fn infer_dense(&self, input: &ArrayView3<f32>) -> Result<Array2<f32>, Self::Error> {
    let plane = self.band_plane(input)?;
    Ok(plane.mapv(|v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 }))
  }
}

impl FromUrlWithScheme for ThresholdModel {
  const SCHEME: &'static str = "threshold";
}

/// `threshold://?band=0&level=0.5&category=1&min_pixels=4`
impl FromUrl for ThresholdModel {
  type Error = ThresholdModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ThresholdModelError::SchemeMismatch);
    }

    let mut model = ThresholdModel::new(0, 0.5, 0);
    for (k, v) in url.query_pairs() {
      let invalid =
        |e: &dyn std::fmt::Display| ThresholdModelError::InvalidParameter(k.to_string(), e.to_string());
      match k.as_ref() {
        "band" => model.band = v.parse().map_err(|e| invalid(&e))?,
        "level" => model.level = v.parse().map_err(|e| invalid(&e))?,
        "category" => model.category_id = v.parse().map_err(|e| invalid(&e))?,
        "min_pixels" => {
          let min_pixels: usize = v.parse().map_err(|e| invalid(&e))?;
          model = model.min_pixels(min_pixels);
        }
        _ => {}
      }
    }
    Ok(model)
  }
}
