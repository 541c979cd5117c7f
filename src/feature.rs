// 该文件是 Tianhui （天绘） 项目的一部分。
// src/feature.rs - 要素收集与 GeoJSON 交换格式
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

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::geo::{GeoBounds, GeoError};
use crate::label::CategoryCatalog;
use crate::vectorize::ring_area;

pub const DEFAULT_DEDUP_OVERLAP: f64 = 0.5;
pub const UNKNOWN_CATEGORY: &str = "unknown";

/// 一个矢量化后的实例
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
  /// 地理坐标外环，不重复首点
  pub ring: Vec<(f64, f64)>,
  pub category_id: u32,
  pub score: f32,
  /// 产生该要素的块在处理顺序中的序号
  pub tile_index: usize,
}

impl Feature {
  pub fn new(ring: Vec<(f64, f64)>, category_id: u32, score: f32) -> Self {
    Self {
      ring,
      category_id,
      score,
      tile_index: 0,
    }
  }

  pub fn with_tile_index(mut self, tile_index: usize) -> Self {
    self.tile_index = tile_index;
    self
  }

  pub fn envelope(&self) -> Result<GeoBounds, GeoError> {
    GeoBounds::enclosing(self.ring.iter().copied())
  }

  pub fn area(&self) -> f64 {
    ring_area(&self.ring)
  }
}

/// 跨块去重
///
/// 候选按得分降序、块序号升序排列；若来自其他块的已保留同类要素与候选的
/// 外包框重叠（交集 / 较小外包框面积）严格大于 `overlap_fraction`，丢弃候选。
/// 同一块内的要素互不抑制（嵌套的实例、环形掩膜的内环都会保留）。
/// 返回顺序即保留顺序。
pub fn collect(per_tile: Vec<Vec<Feature>>, overlap_fraction: f64) -> Vec<Feature> {
  let mut candidates: Vec<(Feature, GeoBounds)> = Vec::new();
  for feature in per_tile.into_iter().flatten() {
    match feature.envelope() {
      Ok(envelope) => candidates.push((feature, envelope)),
      Err(e) => warn!(
        "第 {} 块的要素外包框无效, 已丢弃: {}",
        feature.tile_index, e
      ),
    }
  }
  let total = candidates.len();

  // 稳定排序，同分同块时保持原顺序
  candidates.sort_by(|(a, _), (b, _)| {
    b.score
      .partial_cmp(&a.score)
      .unwrap_or(Ordering::Equal)
      .then(a.tile_index.cmp(&b.tile_index))
  });

  let mut kept: Vec<(Feature, GeoBounds)> = Vec::with_capacity(candidates.len());
  for (feature, envelope) in candidates {
    let duplicate = kept.iter().any(|(other, other_env)| {
      other.tile_index != feature.tile_index
        && other.category_id == feature.category_id
        && other_env.overlap_fraction(&envelope) > overlap_fraction
    });
    if !duplicate {
      kept.push((feature, envelope));
    }
  }

  debug!("去重: {} 个候选, 保留 {}", total, kept.len());
  kept.into_iter().map(|(feature, _)| feature).collect()
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
  #[error("多边形没有外环")]
  MissingRing,
  #[error("外环至少需要 4 个点, 实际 {0}")]
  TooFewPositions(usize),
  #[error("外环未闭合")]
  NotClosed,
  #[error("坐标不是有限值")]
  NonFinite,
  #[error("外包框退化: {0}")]
  Degenerate(#[from] GeoError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
  Polygon { coordinates: Vec<Vec<[f64; 2]>> },
}

impl Geometry {
  /// 由开放的环构造多边形，自动闭合
  pub fn polygon(ring: &[(f64, f64)]) -> Self {
    let mut exterior: Vec<[f64; 2]> = ring.iter().map(|&(x, y)| [x, y]).collect();
    if let Some(&first) = exterior.first() {
      if exterior.last() != Some(&first) {
        exterior.push(first);
      }
    }
    Geometry::Polygon {
      coordinates: vec![exterior],
    }
  }

  pub fn exterior(&self) -> Option<&[[f64; 2]]> {
    match self {
      Geometry::Polygon { coordinates } => coordinates.first().map(Vec::as_slice),
    }
  }

  /// 检查外环并返回其外包框
  pub fn validate(&self) -> Result<GeoBounds, GeometryError> {
    let ring = self.exterior().ok_or(GeometryError::MissingRing)?;
    if ring.len() < 4 {
      return Err(GeometryError::TooFewPositions(ring.len()));
    }
    if ring.iter().flatten().any(|v| !v.is_finite()) {
      return Err(GeometryError::NonFinite);
    }
    if ring.first() != ring.last() {
      return Err(GeometryError::NotClosed);
    }
    Ok(GeoBounds::enclosing(ring.iter().map(|p| (p[0], p[1])))?)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Properties {
  #[serde(default)]
  pub category: String,
  #[serde(default)]
  pub confidence: f32,
}

fn feature_kind() -> String {
  "Feature".to_string()
}

fn collection_kind() -> String {
  "FeatureCollection".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoJsonFeature {
  #[serde(rename = "type", default = "feature_kind")]
  pub kind: String,
  pub geometry: Geometry,
  pub properties: Properties,
  /// `[min_x, min_y, max_x, max_y]`
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub bbox: Option<[f64; 4]>,
}

impl GeoJsonFeature {
  pub fn from_feature(feature: &Feature, catalog: &CategoryCatalog) -> Self {
    let category = match catalog.name_of(feature.category_id) {
      Some(name) => name.to_string(),
      None => {
        warn!("类别 {} 不在类别表中, 记为 {}", feature.category_id, UNKNOWN_CATEGORY);
        UNKNOWN_CATEGORY.to_string()
      }
    };
    Self {
      kind: feature_kind(),
      geometry: Geometry::polygon(&feature.ring),
      properties: Properties {
        category,
        confidence: feature.score,
      },
      bbox: feature.envelope().ok().map(|e| e.to_array()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
  #[serde(rename = "type", default = "collection_kind")]
  pub kind: String,
  pub features: Vec<GeoJsonFeature>,
}

impl Default for FeatureCollection {
  fn default() -> Self {
    Self {
      kind: collection_kind(),
      features: Vec::new(),
    }
  }
}

impl FeatureCollection {
  pub fn from_features(features: &[Feature], catalog: &CategoryCatalog) -> Self {
    Self {
      kind: collection_kind(),
      features: features
        .iter()
        .map(|f| GeoJsonFeature::from_feature(f, catalog))
        .collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.features.len()
  }

  pub fn is_empty(&self) -> bool {
    self.features.is_empty()
  }
}
