// 该文件是 Tianhui （天绘） 项目的一部分。
// src/model/stub.rs - 确定性模型
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

use std::convert::Infallible;

use ndarray::{Array2, ArrayView3, Zip, s};
use thiserror::Error;
use url::Url;

use crate::model::{DenseModel, Detection, Model};
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum FixedModelError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("参数 {0} 无效: {1}")]
  InvalidParameter(String, String),
}

/// 对每一块都返回相同检测结果的模型
#[derive(Debug, Clone)]
pub struct FixedModel {
  detections: Vec<Detection>,
}

impl FixedModel {
  pub fn new(detections: Vec<Detection>) -> Self {
    Self { detections }
  }
}

impl Model for FixedModel {
  type Error = Infallible;

  fn infer(&self, _input: &ArrayView3<f32>) -> Result<Vec<Detection>, Self::Error> {
    Ok(self.detections.clone())
  }
}

/// 把每个检测的掩膜以其得分画到概率图上，重叠处取较大值
impl DenseModel for FixedModel {
  type Error = Infallible;

  fn infer_dense(&self, input: &ArrayView3<f32>) -> Result<Array2<f32>, Self::Error> {
    let (_, height, width) = input.dim();
    let mut out = Array2::zeros((height, width));
    for detection in &self.detections {
      let (col, row) = detection.mask_origin;
      let (mask_h, mask_w) = detection.mask.dim();
      let row_end = (row + mask_h).min(height);
      let col_end = (col + mask_w).min(width);
      if row >= row_end || col >= col_end {
        continue;
      }
      let mask = detection.mask.slice(s![..row_end - row, ..col_end - col]);
      let mut region = out.slice_mut(s![row..row_end, col..col_end]);
      Zip::from(&mut region).and(&mask).for_each(|v: &mut f32, &m| {
        if m {
          *v = v.max(detection.score);
        }
      });
    }
    Ok(out)
  }
}

impl FromUrlWithScheme for FixedModel {
  const SCHEME: &'static str = "fixed";
}

/// `fixed://?x=10&y=10&w=20&h=20&score=0.9&category=1`，整框掩膜
impl FromUrl for FixedModel {
  type Error = FixedModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(FixedModelError::SchemeMismatch);
    }

    let mut x = 0.0f32;
    let mut y = 0.0f32;
    let mut w = 16.0f32;
    let mut h = 16.0f32;
    let mut score = 1.0f32;
    let mut category = 0u32;
    for (k, v) in url.query_pairs() {
      let invalid = |e: &dyn std::fmt::Display| FixedModelError::InvalidParameter(k.to_string(), e.to_string());
      match k.as_ref() {
        "x" => x = v.parse().map_err(|e| invalid(&e))?,
        "y" => y = v.parse().map_err(|e| invalid(&e))?,
        "w" => w = v.parse().map_err(|e| invalid(&e))?,
        "h" => h = v.parse().map_err(|e| invalid(&e))?,
        "score" => score = v.parse().map_err(|e| invalid(&e))?,
        "category" => category = v.parse().map_err(|e| invalid(&e))?,
        _ => {}
      }
    }

    Ok(FixedModel::new(vec![Detection::from_box(
      [x, y, x + w, y + h],
      score,
      category,
    )]))
  }
}

/// 以闭包实现的模型
pub struct FnModel<F> {
  call: F,
}

impl<F> FnModel<F> {
  pub fn new<E>(call: F) -> Self
  where
    F: Fn(&ArrayView3<f32>) -> Result<Vec<Detection>, E>,
  {
    Self { call }
  }
}

impl<F, E> Model for FnModel<F>
where
  F: Fn(&ArrayView3<f32>) -> Result<Vec<Detection>, E>,
  E: std::error::Error + Send + Sync + 'static,
{
  type Error = E;

  fn infer(&self, input: &ArrayView3<f32>) -> Result<Vec<Detection>, Self::Error> {
    (self.call)(input)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::Array3;

  #[test]
  fn fixed_model_from_url() {
    let url = Url::parse("fixed://?x=4&y=6&w=20&h=10&score=0.9&category=3").unwrap();
    let model = FixedModel::from_url(&url).unwrap();
    let input = Array3::zeros((1, 32, 32));
    let out = model.infer(&input.view()).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].category_id, 3);
    assert_eq!(out[0].bbox, [4.0, 6.0, 24.0, 16.0]);
    assert_eq!(out[0].mask.dim(), (10, 20));
    assert_eq!(out[0].mask_origin, (4, 6));
  }

  #[test]
  fn fixed_model_paints_dense_output() {
    let model = FixedModel::new(vec![Detection::from_box([28.0, 2.0, 40.0, 4.0], 0.6, 0)]);
    let input = Array3::zeros((1, 8, 32));
    let dense = model.infer_dense(&input.view()).unwrap();
    assert_eq!(dense.dim(), (8, 32));
    assert_eq!(dense[[2, 28]], 0.6);
    assert_eq!(dense[[3, 31]], 0.6);
    assert_eq!(dense[[4, 28]], 0.0);
    assert_eq!(dense.iter().filter(|&&v| v > 0.0).count(), 8);
  }

  #[test]
  fn fixed_model_rejects_bad_numbers() {
    let url = Url::parse("fixed://?score=high").unwrap();
    assert!(matches!(
      FixedModel::from_url(&url),
      Err(FixedModelError::InvalidParameter(..))
    ));
    let url = Url::parse("threshold://?band=0").unwrap();
    assert!(matches!(
      FixedModel::from_url(&url),
      Err(FixedModelError::SchemeMismatch)
    ));
  }
}
