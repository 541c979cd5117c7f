// 该文件是 Tianhui （天绘） 项目的一部分。
// src/tile.rs - 窗口计算与分块
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

use std::sync::Arc;

use ndarray::{Array3, ArrayView3, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::geo::{AffineTransform, GeoBounds, GeoError, RasterWindow};
use crate::raster::GeoRaster;

// 像素坐标取整时容忍的浮点误差
const SNAP_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TileError {
  #[error("分块参数无效: tile_size = {tile_size}, overlap = {overlap}")]
  InvalidTilingParameters { tile_size: usize, overlap: usize },
  #[error("范围超出栅格: {0}")]
  OutOfRasterBounds(String),
  #[error("地理参考错误: {0}")]
  GeoError(#[from] GeoError),
}

pub fn check_tiling(tile_size: usize, overlap: usize) -> Result<(), TileError> {
  if tile_size == 0 || overlap >= tile_size {
    return Err(TileError::InvalidTilingParameters { tile_size, overlap });
  }
  Ok(())
}

/// 由地理范围计算像素窗口，并裁剪到 `[0, size)`
pub fn window_from_bounds(
  transform: &AffineTransform,
  size: (usize, usize),
  bounds: &GeoBounds,
) -> Result<RasterWindow, TileError> {
  let (width, height) = size;
  let inverse = transform.inverse()?;

  let mut min_col = f64::INFINITY;
  let mut min_row = f64::INFINITY;
  let mut max_col = f64::NEG_INFINITY;
  let mut max_row = f64::NEG_INFINITY;
  for (x, y) in bounds.corners() {
    let (col, row) = inverse.apply(x, y);
    min_col = min_col.min(col);
    min_row = min_row.min(row);
    max_col = max_col.max(col);
    max_row = max_row.max(row);
  }

  let col_start = (min_col + SNAP_TOLERANCE).floor().clamp(0.0, width as f64) as usize;
  let row_start = (min_row + SNAP_TOLERANCE).floor().clamp(0.0, height as f64) as usize;
  let col_end = (max_col - SNAP_TOLERANCE).ceil().clamp(0.0, width as f64) as usize;
  let row_end = (max_row - SNAP_TOLERANCE).ceil().clamp(0.0, height as f64) as usize;

  if col_end <= col_start || row_end <= row_start {
    return Err(TileError::OutOfRasterBounds(format!(
      "范围 {:?} 与 {}x{} 栅格无交集",
      bounds.to_array(),
      width,
      height
    )));
  }

  let window = RasterWindow::new(col_start, row_start, col_end - col_start, row_end - row_start);
  debug!("范围 {:?} 对应窗口 {:?}", bounds.to_array(), window);
  Ok(window)
}

/// 单个轴上的分块起点，最后一块向回收以对齐图像边缘
pub fn tile_origins(len: usize, tile_size: usize, overlap: usize) -> Result<Vec<usize>, TileError> {
  check_tiling(tile_size, overlap)?;
  if len <= tile_size {
    return Ok(vec![0]);
  }
  let step = tile_size - overlap;
  let mut origins = Vec::new();
  let mut origin = 0;
  loop {
    if origin + tile_size >= len {
      origins.push(len - tile_size);
      break;
    }
    origins.push(origin);
    origin += step;
  }
  Ok(origins)
}

/// 按行优先顺序的分块位置（坐标相对于 `width × height` 区域）
pub fn tile_windows(
  width: usize,
  height: usize,
  tile_size: usize,
  overlap: usize,
) -> Result<Vec<RasterWindow>, TileError> {
  let cols = tile_origins(width, tile_size, overlap)?;
  let rows = tile_origins(height, tile_size, overlap)?;
  let mut windows = Vec::with_capacity(cols.len() * rows.len());
  for &row in &rows {
    for &col in &cols {
      windows.push(RasterWindow::new(
        col,
        row,
        tile_size.min(width),
        tile_size.min(height),
      ));
    }
  }
  Ok(windows)
}

/// 将 `channels × height × width` 图像切分为互相重叠的块
pub fn partition(
  image: &ArrayView3<f32>,
  tile_size: usize,
  overlap: usize,
) -> Result<Vec<(Array3<f32>, RasterWindow)>, TileError> {
  let (_, height, width) = image.dim();
  if width == 0 || height == 0 {
    return Err(TileError::OutOfRasterBounds("空图像无法分块".to_string()));
  }
  let windows = tile_windows(width, height, tile_size, overlap)?;
  Ok(
    windows
      .into_iter()
      .map(|w| {
        let data = image
          .slice(s![.., w.row_off..w.row_end(), w.col_off..w.col_end()])
          .to_owned();
        (data, w)
      })
      .collect(),
  )
}

/// 一次推理的输入单元
#[derive(Debug, Clone)]
pub struct Tile {
  index: usize,
  data: Arc<Array3<f32>>,
  transform: AffineTransform,
  window: RasterWindow,
}

impl Tile {
  pub fn new(index: usize, data: Array3<f32>, transform: AffineTransform, window: RasterWindow) -> Self {
    Self {
      index,
      data: Arc::new(data),
      transform,
      window,
    }
  }

  /// 行优先处理顺序中的序号
  pub fn index(&self) -> usize {
    self.index
  }

  pub fn data(&self) -> &Array3<f32> {
    &self.data
  }

  pub fn shared_data(&self) -> Arc<Array3<f32>> {
    Arc::clone(&self.data)
  }

  /// 块局部像素 → 地理坐标
  pub fn transform(&self) -> &AffineTransform {
    &self.transform
  }

  /// 在父栅格中的位置
  pub fn window(&self) -> &RasterWindow {
    &self.window
  }

  pub fn height(&self) -> usize {
    self.data.dim().1
  }

  pub fn width(&self) -> usize {
    self.data.dim().2
  }
}

/// 将栅格的某个窗口切分为带地理变换的块
pub fn tile_raster(
  raster: &GeoRaster,
  window: &RasterWindow,
  tile_size: usize,
  overlap: usize,
) -> Result<Vec<Tile>, TileError> {
  check_tiling(tile_size, overlap)?;
  let view = raster.window_view(window)?;
  let tiles = partition(&view, tile_size, overlap)?
    .into_iter()
    .enumerate()
    .map(|(index, (data, local))| {
      let placement = RasterWindow::new(
        window.col_off + local.col_off,
        window.row_off + local.row_off,
        local.width,
        local.height,
      );
      let transform = raster.transform().window(&placement);
      Tile::new(index, data, transform, placement)
    })
    .collect::<Vec<_>>();
  debug!("窗口 {:?} 切分为 {} 块", window, tiles.len());
  Ok(tiles)
}

/// 逐通道标准化 `(v - mean) / std`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
  pub mean: Vec<f32>,
  pub std: Vec<f32>,
}

impl Normalization {
  pub fn imagenet() -> Self {
    Self {
      mean: vec![0.485, 0.456, 0.406],
      std: vec![0.229, 0.224, 0.225],
    }
  }

  /// 返回新的数组；通道数超出配置时沿用最后一组参数
  pub fn apply(&self, data: &ArrayView3<f32>) -> Array3<f32> {
    let mut out = data.to_owned();
    if self.mean.is_empty() || self.std.is_empty() {
      return out;
    }
    for (c, mut plane) in out.axis_iter_mut(Axis(0)).enumerate() {
      let mean = self.mean[c.min(self.mean.len() - 1)];
      let std = self.std[c.min(self.std.len() - 1)];
      let std = if std.abs() < f32::EPSILON { 1.0 } else { std };
      plane.mapv_inplace(|v| (v - mean) / std);
    }
    out
  }
}
