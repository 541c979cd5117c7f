// 该文件是 Tianhui （天绘） 项目的一部分。
// src/raster/geotiff.rs - GeoTIFF 读写
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

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::{Array2, Array3};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::TiffEncoder;
use tiff::encoder::colortype::Gray32Float;
use tiff::tags::Tag;
use tracing::{debug, info};

use super::RasterError;
use crate::geo::AffineTransform;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;

const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const RASTER_PIXEL_IS_AREA: u16 = 1;

fn tag(code: u16) -> Tag {
  Tag::from_u16_exhaustive(code)
}

pub fn is_tiff(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
}

/// 读取 TIFF 像素（`channels × height × width`）及可选的 GeoTIFF 地理参考
///
/// 8/16 位整数缩放到 [0, 1]，其余类型保持原值。
pub fn read_geotiff(path: &Path) -> Result<(Array3<f32>, Option<AffineTransform>), RasterError> {
  let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;
  let (width, height) = decoder.dimensions()?;
  let transform = read_transform(&mut decoder)?;
  let samples: Vec<f32> = match decoder.read_image()? {
    DecodingResult::U8(v) => v.into_iter().map(|x| x as f32 / u8::MAX as f32).collect(),
    DecodingResult::U16(v) => v.into_iter().map(|x| x as f32 / u16::MAX as f32).collect(),
    DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
    DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
    DecodingResult::I8(v) => v.into_iter().map(|x| x as f32).collect(),
    DecodingResult::I16(v) => v.into_iter().map(|x| x as f32).collect(),
    DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
    DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
    DecodingResult::F32(v) => v,
    DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
  };

  let (width, height) = (width as usize, height as usize);
  let pixels = width * height;
  if pixels == 0 || samples.len() % pixels != 0 {
    return Err(RasterError::ShapeMismatch(format!(
      "{}: {} 个采样无法按 {}x{} 排列",
      path.display(),
      samples.len(),
      width,
      height
    )));
  }
  let channels = samples.len() / pixels;
  debug!("GeoTIFF {}: {} 波段, {}x{}", path.display(), channels, width, height);

  // 采样按像素交错存放
  let data = Array3::from_shape_fn((channels, height, width), |(c, h, w)| {
    samples[(h * width + w) * channels + c]
  });
  Ok((data, transform))
}

fn read_transform<R: std::io::Read + std::io::Seek>(
  decoder: &mut Decoder<R>,
) -> Result<Option<AffineTransform>, RasterError> {
  if let Some(value) = decoder.find_tag(tag(MODEL_TRANSFORMATION))? {
    let m = value.into_f64_vec()?;
    if m.len() < 8 {
      return Err(RasterError::GeoTiffError(format!(
        "ModelTransformation 需要 16 个数值, 实际 {}",
        m.len()
      )));
    }
    return Ok(Some(AffineTransform::new(m[0], m[1], m[3], m[4], m[5], m[7])?));
  }

  let scale = decoder.find_tag(tag(MODEL_PIXEL_SCALE))?;
  let tiepoint = decoder.find_tag(tag(MODEL_TIEPOINT))?;
  let (Some(scale), Some(tiepoint)) = (scale, tiepoint) else {
    return Ok(None);
  };
  let scale = scale.into_f64_vec()?;
  let tiepoint = tiepoint.into_f64_vec()?;
  if scale.len() < 2 || tiepoint.len() < 6 {
    return Err(RasterError::GeoTiffError(format!(
      "ModelPixelScale/ModelTiepoint 数值不足: {} / {}",
      scale.len(),
      tiepoint.len()
    )));
  }
  let (sx, sy) = (scale[0], scale[1]);
  let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
  Ok(Some(AffineTransform::new(sx, 0.0, x - i * sx, 0.0, -sy, y + j * sy)?))
}

/// 单波段 f32 结果写为 GeoTIFF
///
/// 北向上的变换写 ModelPixelScale + ModelTiepoint，带旋转的写 ModelTransformation。
pub fn write_geotiff(values: &Array2<f32>, transform: &AffineTransform, path: &Path) -> Result<(), RasterError> {
  let (height, width) = values.dim();
  if width == 0 || height == 0 {
    return Err(RasterError::ShapeMismatch("结果尺寸为零".to_string()));
  }

  let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
  let mut image = encoder.new_image::<Gray32Float>(width as u32, height as u32)?;
  {
    let dir = image.encoder();
    if transform.b == 0.0 && transform.d == 0.0 && transform.e < 0.0 {
      let scale = [transform.a, -transform.e, 0.0];
      dir.write_tag(tag(MODEL_PIXEL_SCALE), scale.as_slice())?;
      let tiepoint = [0.0, 0.0, 0.0, transform.c, transform.f, 0.0];
      dir.write_tag(tag(MODEL_TIEPOINT), tiepoint.as_slice())?;
    } else {
      let matrix = [
        transform.a, transform.b, 0.0, transform.c,
        transform.d, transform.e, 0.0, transform.f,
        0.0, 0.0, 0.0, 0.0,
        0.0, 0.0, 0.0, 1.0,
      ];
      dir.write_tag(tag(MODEL_TRANSFORMATION), matrix.as_slice())?;
    }
    let geokeys: [u16; 8] = [1, 1, 0, 1, GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA];
    dir.write_tag(tag(GEO_KEY_DIRECTORY), geokeys.as_slice())?;
  }
  let data: Vec<f32> = values.iter().copied().collect();
  image.write_data(&data)?;
  info!("结果已保存: {}", path.display());
  Ok(())
}
