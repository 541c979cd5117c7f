// 该文件是 Tianhui （天绘） 项目的一部分。
// src/geo.rs - 地理范围与仿射变换
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

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeoError {
  #[error("地理范围无效: {0}")]
  InvalidBounds(String),
  #[error("仿射变换退化 (行列式 = {0})")]
  DegenerateTransform(f64),
}

/// 地理（经纬度或投影）坐标下的矩形范围
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
  min_x: f64,
  min_y: f64,
  max_x: f64,
  max_y: f64,
}

impl GeoBounds {
  pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Self, GeoError> {
    if ![min_x, min_y, max_x, max_y].iter().all(|v| v.is_finite()) {
      return Err(GeoError::InvalidBounds(format!(
        "坐标必须为有限值: [{}, {}, {}, {}]",
        min_x, min_y, max_x, max_y
      )));
    }
    if min_x >= max_x || min_y >= max_y {
      return Err(GeoError::InvalidBounds(format!(
        "要求 min < max: [{}, {}, {}, {}]",
        min_x, min_y, max_x, max_y
      )));
    }
    Ok(Self {
      min_x,
      min_y,
      max_x,
      max_y,
    })
  }

  /// 由 `[min_x, min_y, max_x, max_y]` 构造
  pub fn from_array(bounds: [f64; 4]) -> Result<Self, GeoError> {
    Self::new(bounds[0], bounds[1], bounds[2], bounds[3])
  }

  /// 包围一组点的最小矩形；少于两个不同坐标的点集无法构成范围
  pub fn enclosing<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Result<Self, GeoError> {
    let mut min_x = f64::INFINITY;
    let mut min_y = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for (x, y) in points {
      min_x = min_x.min(x);
      min_y = min_y.min(y);
      max_x = max_x.max(x);
      max_y = max_y.max(y);
    }
    Self::new(min_x, min_y, max_x, max_y)
  }

  pub fn min_x(&self) -> f64 {
    self.min_x
  }

  pub fn min_y(&self) -> f64 {
    self.min_y
  }

  pub fn max_x(&self) -> f64 {
    self.max_x
  }

  pub fn max_y(&self) -> f64 {
    self.max_y
  }

  pub fn width(&self) -> f64 {
    self.max_x - self.min_x
  }

  pub fn height(&self) -> f64 {
    self.max_y - self.min_y
  }

  pub fn area(&self) -> f64 {
    self.width() * self.height()
  }

  pub fn to_array(&self) -> [f64; 4] {
    [self.min_x, self.min_y, self.max_x, self.max_y]
  }

  /// 四个角点，顺序为 左上、右上、右下、左下（北在上）
  pub fn corners(&self) -> [(f64, f64); 4] {
    [
      (self.min_x, self.max_y),
      (self.max_x, self.max_y),
      (self.max_x, self.min_y),
      (self.min_x, self.min_y),
    ]
  }

  /// 相交部分的面积，不相交时为 0
  pub fn intersection_area(&self, other: &GeoBounds) -> f64 {
    let w = self.max_x.min(other.max_x) - self.min_x.max(other.min_x);
    let h = self.max_y.min(other.max_y) - self.min_y.max(other.min_y);
    if w <= 0.0 || h <= 0.0 { 0.0 } else { w * h }
  }

  /// 相交面积占较小范围面积的比例
  pub fn overlap_fraction(&self, other: &GeoBounds) -> f64 {
    let smaller = self.area().min(other.area());
    if smaller <= 0.0 {
      return 0.0;
    }
    self.intersection_area(other) / smaller
  }
}

/// `min_x,min_y,max_x,max_y`
impl FromStr for GeoBounds {
  type Err = GeoError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let values = s
      .split(',')
      .map(|v| v.trim().parse::<f64>())
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| GeoError::InvalidBounds(format!("'{}': {}", s, e)))?;
    match values.as_slice() {
      &[min_x, min_y, max_x, max_y] => Self::new(min_x, min_y, max_x, max_y),
      _ => Err(GeoError::InvalidBounds(format!("需要 4 个数值: '{}'", s))),
    }
  }
}

/// 像素窗口，单位为像素，总是落在源栅格范围内
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RasterWindow {
  pub col_off: usize,
  pub row_off: usize,
  pub width: usize,
  pub height: usize,
}

impl RasterWindow {
  pub fn new(col_off: usize, row_off: usize, width: usize, height: usize) -> Self {
    Self {
      col_off,
      row_off,
      width,
      height,
    }
  }

  /// 覆盖整幅栅格的窗口
  pub fn full(width: usize, height: usize) -> Self {
    Self::new(0, 0, width, height)
  }

  pub fn col_end(&self) -> usize {
    self.col_off + self.width
  }

  pub fn row_end(&self) -> usize {
    self.row_off + self.height
  }

  pub fn is_empty(&self) -> bool {
    self.width == 0 || self.height == 0
  }

  pub fn fits_within(&self, width: usize, height: usize) -> bool {
    self.col_end() <= width && self.row_end() <= height
  }

  /// 与另一个窗口的交集
  pub fn intersect(&self, other: &RasterWindow) -> Option<RasterWindow> {
    let col_off = self.col_off.max(other.col_off);
    let row_off = self.row_off.max(other.row_off);
    let col_end = self.col_end().min(other.col_end());
    let row_end = self.row_end().min(other.row_end());
    if col_end <= col_off || row_end <= row_off {
      return None;
    }
    Some(RasterWindow::new(
      col_off,
      row_off,
      col_end - col_off,
      row_end - row_off,
    ))
  }
}

/// 像素 → 地理坐标的仿射变换
///
/// `x = a * col + b * row + c`，`y = d * col + e * row + f`，
/// 其中 `(col, row)` 以像素左上角为原点，像素中心位于 `(col + 0.5, row + 0.5)`。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
  pub a: f64,
  pub b: f64,
  pub c: f64,
  pub d: f64,
  pub e: f64,
  pub f: f64,
}

impl AffineTransform {
  pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Result<Self, GeoError> {
    let transform = Self { a, b, c, d, e, f };
    let det = transform.determinant();
    if det == 0.0 || !det.is_finite() || !c.is_finite() || !f.is_finite() {
      return Err(GeoError::DegenerateTransform(det));
    }
    Ok(transform)
  }

  pub fn identity() -> Self {
    Self {
      a: 1.0,
      b: 0.0,
      c: 0.0,
      d: 0.0,
      e: 1.0,
      f: 0.0,
    }
  }

  /// 北向上的栅格变换：左上角原点 + 像元大小
  pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Result<Self, GeoError> {
    Self::new(pixel_width, 0.0, origin_x, 0.0, -pixel_height, origin_y)
  }

  /// 将 `width × height` 的像素网格线性铺满 `bounds`，第 0 行对应北边
  pub fn from_bounds(bounds: &GeoBounds, width: usize, height: usize) -> Result<Self, GeoError> {
    if width == 0 || height == 0 {
      return Err(GeoError::InvalidBounds(format!(
        "像素网格尺寸不能为零: {}x{}",
        width, height
      )));
    }
    Self::new(
      bounds.width() / width as f64,
      0.0,
      bounds.min_x(),
      0.0,
      -bounds.height() / height as f64,
      bounds.max_y(),
    )
  }

  pub fn determinant(&self) -> f64 {
    self.a * self.e - self.b * self.d
  }

  pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
    (
      self.a * col + self.b * row + self.c,
      self.d * col + self.e * row + self.f,
    )
  }

  pub fn inverse(&self) -> Result<Self, GeoError> {
    let det = self.determinant();
    if det == 0.0 || !det.is_finite() {
      return Err(GeoError::DegenerateTransform(det));
    }
    Ok(Self {
      a: self.e / det,
      b: -self.b / det,
      c: (self.b * self.f - self.e * self.c) / det,
      d: -self.d / det,
      e: self.a / det,
      f: (self.d * self.c - self.a * self.f) / det,
    })
  }

  /// 组合：先应用 `inner`，再应用 `self`
  pub fn compose(&self, inner: &AffineTransform) -> Self {
    Self {
      a: self.a * inner.a + self.b * inner.d,
      b: self.a * inner.b + self.b * inner.e,
      c: self.a * inner.c + self.b * inner.f + self.c,
      d: self.d * inner.a + self.e * inner.d,
      e: self.d * inner.b + self.e * inner.e,
      f: self.d * inner.c + self.e * inner.f + self.f,
    }
  }

  /// 组合：先应用 `self`，再应用 `outer`
  pub fn then(&self, outer: &AffineTransform) -> Self {
    outer.compose(self)
  }

  /// 窗口局部像素坐标（原点为窗口左上角）到同一地理空间的变换
  pub fn window(&self, window: &RasterWindow) -> Self {
    let shift = Self {
      a: 1.0,
      b: 0.0,
      c: window.col_off as f64,
      d: 0.0,
      e: 1.0,
      f: window.row_off as f64,
    };
    self.compose(&shift)
  }

  /// 窗口四角映射后的外包范围
  pub fn bounds_of_window(&self, window: &RasterWindow) -> Result<GeoBounds, GeoError> {
    let local = self.window(window);
    let (w, h) = (window.width as f64, window.height as f64);
    GeoBounds::enclosing([
      local.apply(0.0, 0.0),
      local.apply(w, 0.0),
      local.apply(w, h),
      local.apply(0.0, h),
    ])
  }

  pub fn is_identity(&self, tolerance: f64) -> bool {
    let identity = Self::identity();
    [
      (self.a, identity.a),
      (self.b, identity.b),
      (self.c, identity.c),
      (self.d, identity.d),
      (self.e, identity.e),
      (self.f, identity.f),
    ]
    .iter()
    .all(|(v, w)| (v - w).abs() <= tolerance)
  }
}

/// 输出数组所对应的范围
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputExtent {
  /// 原生栅格中的像素窗口
  Window(RasterWindow),
  /// 铺满地理范围的 `width × height` 逻辑网格，与原生栅格无关
  Bounds {
    bounds: GeoBounds,
    width: usize,
    height: usize,
  },
}

/// 输出数组局部像素 → 原生地理坐标
pub fn compose(native: &AffineTransform, extent: &OutputExtent) -> Result<AffineTransform, GeoError> {
  match extent {
    OutputExtent::Window(window) => Ok(native.window(window)),
    OutputExtent::Bounds {
      bounds,
      width,
      height,
    } => AffineTransform::from_bounds(bounds, *width, *height),
  }
}
