// 该文件是 Tianhui （天绘） 项目的一部分。
// src/raster/image_file.rs - 图像文件栅格（GeoTIFF 或图像 + World 文件）
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

use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, ImageReader, Luma};
use ndarray::{Array2, Array3};
use tracing::{debug, error, info};
use url::Url;

use super::{GeoRaster, RasterError, is_tiff, read_geotiff, read_world_file, world_file_path, write_world_file};
use crate::geo::AffineTransform;
use crate::{FromUrl, FromUrlWithScheme};

/// `raster:///path/to/site.tif[?bands=0,1,2]`
pub struct ImageFileRaster {
  path: PathBuf,
  bands: Option<Vec<usize>>,
}

impl FromUrlWithScheme for ImageFileRaster {
  const SCHEME: &'static str = "raster";
}

impl FromUrl for ImageFileRaster {
  type Error = RasterError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(RasterError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let path = urlencoding::decode(url.path())
      .map_err(|e| RasterError::WorldFileError(format!("路径解码失败: {}", e)))?
      .into_owned();

    let mut bands = None;
    for (k, v) in url.query_pairs() {
      if k == "bands" {
        let parsed = v
          .split(',')
          .map(|b| {
            b.trim()
              .parse::<usize>()
              .map_err(|e| RasterError::WorldFileError(format!("波段参数无效 '{}': {}", b, e)))
          })
          .collect::<Result<Vec<_>, _>>()?;
        bands = Some(parsed);
      }
    }

    Ok(ImageFileRaster {
      path: PathBuf::from(path),
      bands,
    })
  }
}

impl ImageFileRaster {
  pub fn new<P: AsRef<Path>>(path: P) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      bands: None,
    }
  }

  pub fn with_bands(mut self, bands: Vec<usize>) -> Self {
    self.bands = Some(bands);
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// 读取栅格；GeoTIFF 优先使用文件内的地理参考，缺失时退回同名 World 文件
  pub fn load(&self) -> Result<GeoRaster, RasterError> {
    info!("读取栅格文件: {}", self.path.display());
    let raster = if is_tiff(&self.path) {
      let (data, transform) = read_geotiff(&self.path)?;
      let transform = match transform {
        Some(transform) => transform,
        None => {
          debug!("{} 不含 GeoTIFF 地理参考, 查找 World 文件", self.path.display());
          self.load_transform()?
        }
      };
      GeoRaster::new(data, transform)
    } else {
      let image = ImageReader::open(&self.path)?.decode()?;
      GeoRaster::new(image_to_array(&image), self.load_transform()?)
    };
    debug!(
      "栅格尺寸: {} 波段, {}x{}",
      raster.channels(),
      raster.width(),
      raster.height()
    );
    match &self.bands {
      Some(bands) => raster.select_bands(bands),
      None => Ok(raster),
    }
  }

  fn load_transform(&self) -> Result<AffineTransform, RasterError> {
    let candidates = world_file_path(&self.path);
    for candidate in &candidates {
      if candidate.exists() {
        return read_world_file(candidate);
      }
    }
    Err(RasterError::WorldFileError(format!(
      "找不到 World 文件, 已尝试: {:?}",
      candidates
    )))
  }
}

/// 按通道拆分为 `channels × height × width`，8 位数据缩放到 [0, 1]
fn image_to_array(image: &DynamicImage) -> Array3<f32> {
  let (width, height) = (image.width() as usize, image.height() as usize);
  match image.color().channel_count() {
    1 | 2 => {
      let luma = image.to_luma32f();
      Array3::from_shape_fn((1, height, width), |(_, h, w)| {
        luma.get_pixel(w as u32, h as u32)[0]
      })
    }
    3 => {
      let rgb = image.to_rgb32f();
      Array3::from_shape_fn((3, height, width), |(c, h, w)| {
        rgb.get_pixel(w as u32, h as u32)[c]
      })
    }
    _ => {
      let rgba = image.to_rgba32f();
      Array3::from_shape_fn((4, height, width), |(c, h, w)| {
        rgba.get_pixel(w as u32, h as u32)[c]
      })
    }
  }
}

/// 将 [0, 1] 范围的单波段结果保存为 8 位 PNG，并写出 World 文件
pub fn save_gray_png(
  values: &Array2<f32>,
  transform: &AffineTransform,
  path: &Path,
) -> Result<PathBuf, RasterError> {
  let (height, width) = values.dim();
  let image = GrayImage::from_fn(width as u32, height as u32, |x, y| {
    let v = values[[y as usize, x as usize]];
    let v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
    Luma([(v * 255.0).round() as u8])
  });
  image.save(path)?;
  let world = world_file_path(path)
    .into_iter()
    .next()
    .unwrap_or_else(|| path.with_extension("wld"));
  write_world_file(&world, transform)?;
  info!("结果已保存: {} (+ {})", path.display(), world.display());
  Ok(world)
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgb, RgbImage};

  #[test]
  fn scheme_is_checked() {
    let url = Url::parse("folder:///tmp/a.png").unwrap();
    assert!(matches!(
      ImageFileRaster::from_url(&url),
      Err(RasterError::SchemeMismatch { .. })
    ));
  }

  #[test]
  fn url_carries_path_and_bands() {
    let url = Url::parse("raster:///data/my%20site.png?bands=2,0").unwrap();
    let raster = ImageFileRaster::from_url(&url).unwrap();
    assert_eq!(raster.path(), Path::new("/data/my site.png"));
    assert_eq!(raster.bands, Some(vec![2, 0]));
  }

  #[test]
  fn loads_image_with_world_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("site.png");
    let mut image = RgbImage::new(4, 3);
    image.put_pixel(1, 2, Rgb([255, 0, 51]));
    image.save(&path).unwrap();
    std::fs::write(dir.path().join("site.pgw"), "2\n0\n0\n-2\n1\n-1\n").unwrap();

    let raster = ImageFileRaster::new(&path).load().unwrap();
    assert_eq!(raster.channels(), 3);
    assert_eq!(raster.size(), (4, 3));
    assert!((raster.view()[[0, 2, 1]] - 1.0).abs() < 1e-6);
    assert!((raster.view()[[2, 2, 1]] - 0.2).abs() < 1e-6);
    assert_eq!(raster.transform().apply(0.0, 0.0), (0.0, 0.0));
  }

  #[test]
  fn missing_world_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.png");
    RgbImage::new(2, 2).save(&path).unwrap();
    assert!(matches!(
      ImageFileRaster::new(&path).load(),
      Err(RasterError::WorldFileError(_))
    ));
  }

  #[test]
  fn geotiff_needs_no_world_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("site.tif");
    let values = Array2::from_shape_fn((5, 6), |(r, c)| (r + c) as f32);
    let transform = AffineTransform::north_up(500_000.0, 4_000_000.0, 0.3, 0.3).unwrap();
    super::super::write_geotiff(&values, &transform, &path).unwrap();

    let raster = ImageFileRaster::new(&path).load().unwrap();
    assert_eq!(raster.size(), (6, 5));
    assert_eq!(raster.transform(), &transform);
    assert_eq!(raster.view()[[0, 4, 5]], 9.0);
  }

  #[test]
  fn saves_png_and_world_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prob.png");
    let values = Array2::from_shape_fn((2, 3), |(r, c)| (r * 3 + c) as f32 / 5.0);
    let transform = AffineTransform::north_up(5.0, 10.0, 1.0, 1.0).unwrap();
    let world = save_gray_png(&values, &transform, &path).unwrap();
    assert_eq!(world, dir.path().join("prob.pgw"));
    let back = ImageFileRaster::new(&path).load().unwrap();
    assert_eq!(back.size(), (3, 2));
    assert_eq!(back.transform(), &transform);
    assert!((back.view()[[0, 1, 2]] - 1.0).abs() < 1e-6);
  }
}
