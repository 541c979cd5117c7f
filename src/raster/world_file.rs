// 该文件是 Tianhui （天绘） 项目的一部分。
// src/raster/world_file.rs - ESRI World 文件读写
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

use tracing::debug;

use super::RasterError;
use crate::geo::AffineTransform;

/// 图像文件对应的 World 文件候选路径，`a.png` → `a.pgw`, `a.wld`
pub fn world_file_path(image: &Path) -> Vec<PathBuf> {
  let mut candidates = Vec::new();
  if let Some(ext) = image.extension().and_then(|e| e.to_str()) {
    let chars: Vec<char> = ext.chars().collect();
    if let (Some(first), Some(last)) = (chars.first(), chars.last()) {
      candidates.push(image.with_extension(format!("{}{}w", first, last)));
    }
    candidates.push(image.with_extension(format!("{}w", ext)));
  }
  candidates.push(image.with_extension("wld"));
  candidates
}

/// World 文件六行依次为 A D B E C F，其中 C/F 指左上像素的中心
pub fn read_world_file(path: &Path) -> Result<AffineTransform, RasterError> {
  let content = std::fs::read_to_string(path)?;
  let values = content
    .split_whitespace()
    .map(|v| {
      v.parse::<f64>()
        .map_err(|e| RasterError::WorldFileError(format!("{}: {}", v, e)))
    })
    .collect::<Result<Vec<_>, _>>()?;
  if values.len() != 6 {
    return Err(RasterError::WorldFileError(format!(
      "{} 应包含 6 个数值, 实际 {}",
      path.display(),
      values.len()
    )));
  }
  let [a, d, b, e, cx, cy] = [values[0], values[1], values[2], values[3], values[4], values[5]];
  debug!("读取 World 文件 {}: {:?}", path.display(), values);
  let transform = AffineTransform::new(
    a,
    b,
    cx - 0.5 * a - 0.5 * b,
    d,
    e,
    cy - 0.5 * d - 0.5 * e,
  )?;
  Ok(transform)
}

pub fn write_world_file(path: &Path, transform: &AffineTransform) -> Result<(), RasterError> {
  let (cx, cy) = transform.apply(0.5, 0.5);
  let content = format!(
    "{}\n{}\n{}\n{}\n{}\n{}\n",
    transform.a, transform.d, transform.b, transform.e, cx, cy
  );
  std::fs::write(path, content)?;
  Ok(())
}
