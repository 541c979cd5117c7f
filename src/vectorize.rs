// 该文件是 Tianhui （天绘） 项目的一部分。
// src/vectorize.rs - 掩膜矢量化
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

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::feature::Feature;
use crate::geo::AffineTransform;
use crate::model::Detection;

pub const MASK_LEVEL: f32 = 0.5;
pub const DEFAULT_MIN_AREA: f64 = 4.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorizeError {
  #[error("掩膜没有面积不小于 {min_area} 的轮廓 (类别 {category_id}, 得分 {score:.2})")]
  EmptyMask {
    category_id: u32,
    score: f32,
    min_area: f64,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VectorizeOptions {
  /// 面积小于该值（像素²）的轮廓视为噪声
  pub min_area: f64,
}

impl Default for VectorizeOptions {
  fn default() -> Self {
    Self {
      min_area: DEFAULT_MIN_AREA,
    }
  }
}

/// 概率图 → 二值掩膜（严格大于阈值）
pub fn binarize(probabilities: &ArrayView2<f32>, threshold: f32) -> Array2<bool> {
  probabilities.mapv(|v| v > threshold)
}

// 网格边：H(r, c) 连接 (r, c)-(r, c+1)，V(r, c) 连接 (r, c)-(r+1, c)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Edge {
  H(usize, usize),
  V(usize, usize),
}

struct PaddedField<'a, 'b> {
  field: &'a ArrayView2<'b, f32>,
  pad: f32,
  rows: usize,
  cols: usize,
}

impl PaddedField<'_, '_> {
  fn value(&self, r: usize, c: usize) -> f32 {
    if r == 0 || c == 0 || r + 1 >= self.rows || c + 1 >= self.cols {
      return self.pad;
    }
    let v = self.field[[r - 1, c - 1]];
    if v.is_nan() { self.pad } else { v }
  }
}

/// 在 `level` 等值线处追踪闭合轮廓（marching squares）
///
/// 场外一圈视为低于 `level`，因此所有轮廓都闭合。返回的坐标为 `(col, row)`，
/// 以像素中心为整数点；环不重复首点。顶点顺序保持追踪方向：沿行进方向，
/// 高于 `level` 的区域在右侧（y 轴向下）。
pub fn trace_contours(field: &ArrayView2<f32>, level: f32) -> Vec<Vec<(f64, f64)>> {
  let (height, width) = field.dim();
  if height == 0 || width == 0 {
    return Vec::new();
  }
  let padded = PaddedField {
    field,
    pad: if level > 0.0 { 0.0 } else { level - 1.0 },
    rows: height + 2,
    cols: width + 2,
  };
  let inside = |r: usize, c: usize| padded.value(r, c) > level;

  let mut next: BTreeMap<Edge, Edge> = BTreeMap::new();
  for r in 0..padded.rows - 1 {
    for c in 0..padded.cols - 1 {
      let case = (inside(r, c) as u8)
        | (inside(r, c + 1) as u8) << 1
        | (inside(r + 1, c + 1) as u8) << 2
        | (inside(r + 1, c) as u8) << 3;
      let top = Edge::H(r, c);
      let bottom = Edge::H(r + 1, c);
      let left = Edge::V(r, c);
      let right = Edge::V(r, c + 1);
      let mut link = |from: Edge, to: Edge| {
        next.insert(from, to);
      };
      match case {
        0 | 15 => {}
        1 => link(top, left),
        2 => link(right, top),
        3 => link(right, left),
        4 => link(bottom, right),
        6 => link(bottom, top),
        7 => link(bottom, left),
        8 => link(left, bottom),
        9 => link(top, bottom),
        11 => link(right, bottom),
        12 => link(left, right),
        13 => link(top, right),
        14 => link(left, top),
        5 | 10 => {
          let centre = (padded.value(r, c)
            + padded.value(r, c + 1)
            + padded.value(r + 1, c + 1)
            + padded.value(r + 1, c))
            / 4.0;
          match (case, centre > level) {
            (5, true) => {
              link(top, right);
              link(bottom, left);
            }
            (5, false) => {
              link(top, left);
              link(bottom, right);
            }
            (_, true) => {
              link(left, top);
              link(right, bottom);
            }
            (_, false) => {
              link(right, top);
              link(left, bottom);
            }
          }
        }
        _ => unreachable!("四位掩码只有 16 种情况"),
      }
    }
  }

  let point = |edge: Edge| -> (f64, f64) {
    let (r0, c0, r1, c1) = match edge {
      Edge::H(r, c) => (r, c, r, c + 1),
      Edge::V(r, c) => (r, c, r + 1, c),
    };
    let v0 = padded.value(r0, c0) as f64;
    let v1 = padded.value(r1, c1) as f64;
    let t = if (v1 - v0).abs() < f64::EPSILON {
      0.5
    } else {
      (level as f64 - v0) / (v1 - v0)
    };
    // 去掉外圈偏移
    let col = c0 as f64 + t * (c1 - c0) as f64 - 1.0;
    let row = r0 as f64 + t * (r1 - r0) as f64 - 1.0;
    (col, row)
  };

  let mut rings = Vec::new();
  while let Some(start) = next.keys().next().copied() {
    let mut ring = Vec::new();
    let mut current = start;
    while let Some(following) = next.remove(&current) {
      ring.push(point(current));
      current = following;
    }
    if ring.len() >= 3 {
      rings.push(ring);
    }
  }
  rings
}

/// 有向面积（鞋带公式）
pub fn signed_area(ring: &[(f64, f64)]) -> f64 {
  if ring.len() < 3 {
    return 0.0;
  }
  let mut sum = 0.0;
  for (i, &(x0, y0)) in ring.iter().enumerate() {
    let (x1, y1) = ring[(i + 1) % ring.len()];
    sum += x0 * y1 - x1 * y0;
  }
  sum / 2.0
}

pub fn ring_area(ring: &[(f64, f64)]) -> f64 {
  signed_area(ring).abs()
}

/// 检测掩膜 → 地理坐标多边形，每个保留下来的环对应一个要素
pub fn vectorize(
  detection: &Detection,
  transform: &AffineTransform,
  options: &VectorizeOptions,
) -> Result<Vec<Feature>, VectorizeError> {
  let field = detection.mask.mapv(|m| if m { 1.0f32 } else { 0.0 });
  let rings = trace_contours(&field.view(), MASK_LEVEL);
  let traced = rings.len();
  let (origin_col, origin_row) = (
    detection.mask_origin.0 as f64,
    detection.mask_origin.1 as f64,
  );

  let features: Vec<Feature> = rings
    .into_iter()
    .filter(|ring| ring_area(ring) >= options.min_area)
    .map(|ring| {
      let geo_ring = ring
        .into_iter()
        .map(|(col, row)| transform.apply(col + 0.5 + origin_col, row + 0.5 + origin_row))
        .collect();
      Feature::new(geo_ring, detection.category_id, detection.score)
    })
    .collect();

  debug!(
    "掩膜 {:?}: 追踪到 {} 个轮廓, 保留 {}",
    detection.mask.dim(),
    traced,
    features.len()
  );

  if features.is_empty() {
    return Err(VectorizeError::EmptyMask {
      category_id: detection.category_id,
      score: detection.score,
      min_area: options.min_area,
    });
  }
  Ok(features)
}
