// 该文件是 Tianhui （天绘） 项目的一部分。
// src/raster.rs - 带地理参考的栅格
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

use ndarray::{Array3, ArrayView3, Axis, s};
use thiserror::Error;

use crate::geo::{AffineTransform, GeoBounds, GeoError, RasterWindow};
use crate::tile::{TileError, window_from_bounds};

#[cfg(feature = "read_image_file")]
mod image_file;
#[cfg(feature = "read_image_file")]
pub use self::image_file::{ImageFileRaster, save_gray_png};

#[cfg(feature = "read_image_file")]
mod geotiff;
#[cfg(feature = "read_image_file")]
pub use self::geotiff::{is_tiff, read_geotiff, write_geotiff};

mod world_file;
pub use self::world_file::{read_world_file, world_file_path, write_world_file};

#[derive(Error, Debug)]
pub enum RasterError {
  #[error("URI 方案不匹配: 期望 {expected}, 实际 {found}")]
  SchemeMismatch {
    expected: &'static str,
    found: String,
  },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[cfg(feature = "read_image_file")]
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[cfg(feature = "read_image_file")]
  #[error("TIFF 错误: {0}")]
  TiffError(#[from] tiff::TiffError),
  #[error("GeoTIFF 地理参考无效: {0}")]
  GeoTiffError(String),
  #[error("World 文件无效: {0}")]
  WorldFileError(String),
  #[error("数据形状不匹配: {0}")]
  ShapeMismatch(String),
  #[error("波段索引越界: {band} (共 {channels} 个波段)")]
  BandOutOfRange { band: usize, channels: usize },
  #[error("地理参考错误: {0}")]
  GeoError(#[from] GeoError),
}

/// 像素数据 (`channels × height × width`) 及其原生仿射变换
#[derive(Debug, Clone)]
pub struct GeoRaster {
  data: Array3<f32>,
  transform: AffineTransform,
}

impl GeoRaster {
  pub fn new(data: Array3<f32>, transform: AffineTransform) -> Self {
    Self { data, transform }
  }

  pub fn from_shape_vec(
    channels: usize,
    height: usize,
    width: usize,
    values: Vec<f32>,
    transform: AffineTransform,
  ) -> Result<Self, RasterError> {
    let expected = channels * height * width;
    if values.len() != expected {
      return Err(RasterError::ShapeMismatch(format!(
        "期望长度 {}, 实际长度 {}",
        expected,
        values.len()
      )));
    }
    let data = Array3::from_shape_vec((channels, height, width), values)
      .map_err(|e| RasterError::ShapeMismatch(e.to_string()))?;
    Ok(Self { data, transform })
  }

  pub fn channels(&self) -> usize {
    self.data.dim().0
  }

  pub fn height(&self) -> usize {
    self.data.dim().1
  }

  pub fn width(&self) -> usize {
    self.data.dim().2
  }

  /// `(width, height)`
  pub fn size(&self) -> (usize, usize) {
    (self.width(), self.height())
  }

  pub fn transform(&self) -> &AffineTransform {
    &self.transform
  }

  pub fn view(&self) -> ArrayView3<'_, f32> {
    self.data.view()
  }

  pub fn full_window(&self) -> RasterWindow {
    RasterWindow::full(self.width(), self.height())
  }

  pub fn bounds(&self) -> Result<GeoBounds, GeoError> {
    self.transform.bounds_of_window(&self.full_window())
  }

  pub fn window_from_bounds(&self, bounds: &GeoBounds) -> Result<RasterWindow, TileError> {
    window_from_bounds(&self.transform, self.size(), bounds)
  }

  /// 窗口内的像素视图，窗口必须位于栅格内
  pub fn window_view(&self, window: &RasterWindow) -> Result<ArrayView3<'_, f32>, TileError> {
    if window.is_empty() || !window.fits_within(self.width(), self.height()) {
      return Err(TileError::OutOfRasterBounds(format!(
        "窗口 {:?} 超出栅格 {}x{}",
        window,
        self.width(),
        self.height()
      )));
    }
    Ok(self.data.slice(s![
      ..,
      window.row_off..window.row_end(),
      window.col_off..window.col_end()
    ]))
  }

  /// 仅保留指定波段，顺序按参数给出
  pub fn select_bands(&self, bands: &[usize]) -> Result<GeoRaster, RasterError> {
    let channels = self.channels();
    if let Some(&band) = bands.iter().find(|&&b| b >= channels) {
      return Err(RasterError::BandOutOfRange { band, channels });
    }
    Ok(GeoRaster {
      data: self.data.select(Axis(0), bands),
      transform: self.transform,
    })
  }
}
