// 该文件是 Tianhui （天绘） 项目的一部分。
// src/stitch.rs - 分块预测拼接
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

use std::sync::Mutex;

use ndarray::{Array1, Array2, ArrayView2, Zip, s};
use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

use crate::geo::RasterWindow;

const MIN_WEIGHT: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StitchError {
  #[error("分块参数无效: tile_size = {tile_size}, overlap = {overlap}")]
  InvalidTilingParameters { tile_size: usize, overlap: usize },
  #[error("预测尺寸 {found:?} 与窗口尺寸 {expected:?} 不一致")]
  ShapeMismatch {
    expected: (usize, usize),
    found: (usize, usize),
  },
  #[error("窗口 {window:?} 超出输出范围 {width}x{height}")]
  PlacementOutOfBounds {
    window: RasterWindow,
    width: usize,
    height: usize,
  },
  #[error("累加器锁已失效")]
  Poisoned,
}

fn ramp(len: usize, overlap: usize) -> Array1<f64> {
  if overlap == 0 {
    return Array1::ones(len);
  }
  let o = overlap as f64;
  let n = len as f64;
  Array1::from_shape_fn(len, |i| {
    let i = i as f64;
    ((i + 0.5) / o).min((n - i - 0.5) / o).min(1.0)
  })
}

/// 块内融合权重：各轴线性斜坡相乘，`overlap == 0` 时全为 1
///
/// 步长为 `tile_size - overlap` 的相邻两块在重叠带内权重之和为 1。
pub fn weight_matrix(height: usize, width: usize, overlap: usize) -> Array2<f64> {
  let rows = ramp(height, overlap);
  let cols = ramp(width, overlap);
  Array2::from_shape_fn((height, width), |(r, c)| rows[r] * cols[c])
}

struct Accumulator {
  sum: Array2<f64>,
  weight: Array2<f64>,
}

/// 加权累加各块预测，最后统一归一化
pub struct Stitcher {
  height: usize,
  width: usize,
  overlap: usize,
  accumulator: Mutex<Accumulator>,
}

impl Stitcher {
  pub fn new(height: usize, width: usize, overlap: usize) -> Self {
    Self {
      height,
      width,
      overlap,
      accumulator: Mutex::new(Accumulator {
        sum: Array2::zeros((height, width)),
        weight: Array2::zeros((height, width)),
      }),
    }
  }

  pub fn size(&self) -> (usize, usize) {
    (self.width, self.height)
  }

  pub fn add(&self, values: &ArrayView2<f32>, placement: &RasterWindow) -> Result<(), StitchError> {
    let expected = (placement.height, placement.width);
    if values.dim() != expected {
      return Err(StitchError::ShapeMismatch {
        expected,
        found: values.dim(),
      });
    }
    if placement.is_empty() || !placement.fits_within(self.width, self.height) {
      return Err(StitchError::PlacementOutOfBounds {
        window: *placement,
        width: self.width,
        height: self.height,
      });
    }

    let weights = weight_matrix(placement.height, placement.width, self.overlap);
    let weighted = Zip::from(&weights)
      .and(values)
      .map_collect(|&w, &v| if v.is_finite() { w * v as f64 } else { 0.0 });
    let weights = Zip::from(&weights)
      .and(values)
      .map_collect(|&w, &v| if v.is_finite() { w } else { 0.0 });

    let (rows, cols) = (
      placement.row_off..placement.row_end(),
      placement.col_off..placement.col_end(),
    );
    let mut acc = self.accumulator.lock().map_err(|_| StitchError::Poisoned)?;
    let mut sum = acc.sum.slice_mut(s![rows.clone(), cols.clone()]);
    sum += &weighted;
    let mut weight = acc.weight.slice_mut(s![rows, cols]);
    weight += &weights;
    Ok(())
  }

  /// `sum / max(weight, 1e-6)`，从未覆盖的像素为 0
  pub fn finish(self) -> Result<Array2<f32>, StitchError> {
    let acc = self
      .accumulator
      .into_inner()
      .map_err(|_| StitchError::Poisoned)?;
    let covered = acc.weight.iter().filter(|&&w| w > 0.0).count();
    debug!(
      "拼接完成: {}x{}, 覆盖 {} 像素",
      self.width, self.height, covered
    );
    Ok(Zip::from(&acc.sum)
      .and(&acc.weight)
      .map_collect(|&s, &w| (s / w.max(MIN_WEIGHT)) as f32))
  }
}

/// 将 `(预测, 窗口)` 拼接为 `output_size = (width, height)` 的单幅栅格
pub fn stitch(
  tiles: &[(Array2<f32>, RasterWindow)],
  output_size: (usize, usize),
  tile_size: usize,
  overlap: usize,
) -> Result<Array2<f32>, StitchError> {
  if tile_size == 0 || overlap >= tile_size {
    return Err(StitchError::InvalidTilingParameters { tile_size, overlap });
  }
  let (width, height) = output_size;
  let stitcher = Stitcher::new(height, width, overlap);
  tiles
    .par_iter()
    .try_for_each(|(values, placement)| stitcher.add(&values.view(), placement))?;
  stitcher.finish()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tile::tile_windows;

  fn pattern(window: &RasterWindow) -> Array2<f32> {
    Array2::from_shape_fn((window.height, window.width), |(r, c)| {
      let (gr, gc) = ((r + window.row_off) as f32, (c + window.col_off) as f32);
      (gr * 0.37 + gc * 0.11).sin()
    })
  }

  #[test]
  fn weights_sum_to_one_in_shared_band() {
    let w = ramp(128, 32);
    for i in 96..128 {
      let total = w[i] + w[i - 96];
      assert!((total - 1.0).abs() < 1e-12, "i = {i}: {total}");
    }
    assert!(w[0] > 0.0);
    assert_eq!(w[64], 1.0);
  }

  #[test]
  fn zero_overlap_is_uniform() {
    assert!(weight_matrix(5, 7, 0).iter().all(|&w| w == 1.0));
  }

  #[test]
  fn constant_tiles_reconstruct_constant() {
    let windows = tile_windows(200, 150, 64, 16).unwrap();
    let tiles: Vec<_> = windows
      .iter()
      .map(|w| (Array2::from_elem((w.height, w.width), 3.0f32), *w))
      .collect();
    let out = stitch(&tiles, (200, 150), 64, 16).unwrap();
    assert_eq!(out.dim(), (150, 200));
    assert!(out.iter().all(|&v| (v - 3.0).abs() < 1e-5));
  }

  #[test]
  fn consistent_tiles_reconstruct_the_source() {
    let windows = tile_windows(100, 90, 40, 10).unwrap();
    let tiles: Vec<_> = windows.iter().map(|w| (pattern(w), *w)).collect();
    let out = stitch(&tiles, (100, 90), 40, 10).unwrap();
    let expected = pattern(&RasterWindow::full(100, 90));
    for (a, b) in out.iter().zip(expected.iter()) {
      assert!((a - b).abs() < 1e-5);
    }
  }

  #[test]
  fn order_does_not_matter() {
    let windows = tile_windows(120, 120, 48, 12).unwrap();
    let tiles: Vec<_> = windows
      .iter()
      .enumerate()
      .map(|(i, w)| (Array2::from_elem((w.height, w.width), i as f32), *w))
      .collect();
    let forward = stitch(&tiles, (120, 120), 48, 12).unwrap();
    let mut reversed = tiles.clone();
    reversed.reverse();
    let backward = stitch(&reversed, (120, 120), 48, 12).unwrap();
    for (a, b) in forward.iter().zip(backward.iter()) {
      assert!((a - b).abs() < 1e-5);
    }
  }

  #[test]
  fn untouched_pixels_read_zero() {
    let stitcher = Stitcher::new(10, 10, 0);
    let window = RasterWindow::new(0, 0, 4, 4);
    stitcher
      .add(&Array2::from_elem((4, 4), 0.8f32).view(), &window)
      .unwrap();
    let out = stitcher.finish().unwrap();
    assert!((out[[1, 1]] - 0.8).abs() < 1e-6);
    assert_eq!(out[[9, 9]], 0.0);
  }

  #[test]
  fn shape_and_placement_are_checked() {
    let stitcher = Stitcher::new(10, 10, 2);
    let err = stitcher
      .add(&Array2::zeros((3, 4)).view(), &RasterWindow::new(0, 0, 4, 4))
      .unwrap_err();
    assert!(matches!(err, StitchError::ShapeMismatch { .. }));
    let err = stitcher
      .add(&Array2::zeros((4, 4)).view(), &RasterWindow::new(8, 0, 4, 4))
      .unwrap_err();
    assert!(matches!(err, StitchError::PlacementOutOfBounds { .. }));
    assert!(matches!(
      stitch(&[], (10, 10), 8, 8),
      Err(StitchError::InvalidTilingParameters { .. })
    ));
  }
}
