// 该文件是 Tianhui （天绘） 项目的一部分。
// src/model.rs - 模型与推理适配
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

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use ndarray::{Array2, ArrayView3};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::tile::Tile;
use crate::{FromUrl, FromUrlWithScheme};

/// 实例分割模型：输入 `channels × height × width`，输出检测结果
pub trait Model {
  type Error: std::error::Error + Send + Sync + 'static;

  fn infer(&self, input: &ArrayView3<f32>) -> Result<Vec<Detection>, Self::Error>;
}

/// 稠密预测模型：输出与输入同尺寸的概率图，用于拼接路径
pub trait DenseModel {
  type Error: std::error::Error + Send + Sync + 'static;

  fn infer_dense(&self, input: &ArrayView3<f32>) -> Result<Array2<f32>, Self::Error>;
}

#[derive(Debug, Clone)]
pub struct Detection {
  /// 块像素坐标 `[x_min, y_min, x_max, y_max]`
  pub bbox: [f32; 4],
  pub score: f32,
  pub category_id: u32,
  /// `height × width` 的二值掩膜
  pub mask: Array2<bool>,
  /// 掩膜左上角在块内的像素位置 `(col, row)`
  pub mask_origin: (usize, usize),
}

impl Detection {
  /// 掩膜与整块同尺寸
  pub fn with_tile_mask(bbox: [f32; 4], score: f32, category_id: u32, mask: Array2<bool>) -> Self {
    Self {
      bbox,
      score,
      category_id,
      mask,
      mask_origin: (0, 0),
    }
  }

  /// 掩膜只覆盖检测框，原点取框左上角
  pub fn with_box_mask(bbox: [f32; 4], score: f32, category_id: u32, mask: Array2<bool>) -> Self {
    let origin = (bbox[0].max(0.0).floor() as usize, bbox[1].max(0.0).floor() as usize);
    Self {
      bbox,
      score,
      category_id,
      mask,
      mask_origin: origin,
    }
  }

  /// 只有检测框的模型：以整框填充掩膜
  pub fn from_box(bbox: [f32; 4], score: f32, category_id: u32) -> Self {
    let width = (bbox[2].ceil() - bbox[0].max(0.0).floor()).max(0.0) as usize;
    let height = (bbox[3].ceil() - bbox[1].max(0.0).floor()).max(0.0) as usize;
    Self::with_box_mask(bbox, score, category_id, Array2::from_elem((height, width), true))
  }
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("模型推理失败: {0}")]
  Model(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("推理超时 ({0:?})")]
  Timeout(Duration),
  #[error("推理线程意外退出")]
  WorkerLost,
  #[error("置信度阈值必须在 [0, 1] 内: {0}")]
  InvalidThreshold(f32),
}

impl InferenceError {
  pub fn model<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
    InferenceError::Model(Box::new(err))
  }
}

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

type Job<M> = Box<dyn FnOnce(&M) + Send>;

/// 对模型句柄的统一封装
///
/// 模型由一个常驻工作线程独占，推理请求排队依次执行，因此同一句柄同一时刻
/// 只有一次推理。设置超时后，等待（含排队）超过时限返回
/// [`InferenceError::Timeout`]：已开始的推理在后台跑完，尚未开始的直接作废。
/// 模型 panic 时返回 [`InferenceError::WorkerLost`]，工作线程继续服务。
pub struct InferenceAdapter<M> {
  jobs: mpsc::Sender<Job<M>>,
  threshold: f32,
  timeout: Option<Duration>,
}

impl<M> Clone for InferenceAdapter<M> {
  fn clone(&self) -> Self {
    Self {
      jobs: self.jobs.clone(),
      threshold: self.threshold,
      timeout: self.timeout,
    }
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
  payload
    .downcast_ref::<&str>()
    .copied()
    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
    .unwrap_or("未知原因")
}

impl<M: Send + 'static> InferenceAdapter<M> {
  pub fn new(model: M) -> Self {
    let (jobs, queue) = mpsc::channel::<Job<M>>();
    thread::spawn(move || {
      for job in queue {
        job(&model);
      }
      debug!("推理线程退出");
    });
    Self {
      jobs,
      threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      timeout: None,
    }
  }

  pub fn with_threshold(mut self, threshold: f32) -> Result<Self, InferenceError> {
    if !(0.0..=1.0).contains(&threshold) {
      return Err(InferenceError::InvalidThreshold(threshold));
    }
    self.threshold = threshold;
    Ok(self)
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn threshold(&self) -> f32 {
    self.threshold
  }

  fn run_bounded<T, F>(&self, tile: &Tile, call: F) -> Result<T, InferenceError>
  where
    T: Send + 'static,
    F: FnOnce(&M, &ArrayView3<f32>) -> Result<T, InferenceError> + Send + 'static,
  {
    let index = tile.index();
    let data = tile.shared_data();
    let cancelled = Arc::new(AtomicBool::new(false));
    let (reply, result) = mpsc::channel();

    let flag = Arc::clone(&cancelled);
    let job: Job<M> = Box::new(move |model: &M| {
      if flag.load(Ordering::SeqCst) {
        debug!("第 {} 块已超时, 不再推理", index);
        return;
      }
      let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(model, &data.view())))
        .unwrap_or_else(|payload| {
          error!("第 {} 块推理 panic: {}", index, panic_message(payload.as_ref()));
          Err(InferenceError::WorkerLost)
        });
      let _ = reply.send(outcome);
    });
    self.jobs.send(job).map_err(|_| InferenceError::WorkerLost)?;

    let Some(timeout) = self.timeout else {
      return result.recv().unwrap_or(Err(InferenceError::WorkerLost));
    };
    match result.recv_timeout(timeout) {
      Ok(outcome) => outcome,
      Err(mpsc::RecvTimeoutError::Timeout) => {
        cancelled.store(true, Ordering::SeqCst);
        warn!("第 {} 块推理超时 ({:?})", index, timeout);
        Err(InferenceError::Timeout(timeout))
      }
      Err(mpsc::RecvTimeoutError::Disconnected) => {
        error!("第 {} 块推理线程意外退出", index);
        Err(InferenceError::WorkerLost)
      }
    }
  }
}

impl<M: Model + Send + 'static> InferenceAdapter<M> {
  /// 推理并丢弃 `score < threshold` 的检测
  pub fn predict(&self, tile: &Tile) -> Result<Vec<Detection>, InferenceError> {
    let detections = self.run_bounded(tile, |model, input| {
      model.infer(input).map_err(InferenceError::model)
    })?;
    let total = detections.len();
    let kept: Vec<Detection> = detections
      .into_iter()
      .filter(|d| d.score >= self.threshold)
      .collect();
    debug!(
      "第 {} 块: {} 个检测, 阈值 {:.2} 后保留 {}",
      tile.index(),
      total,
      self.threshold,
      kept.len()
    );
    Ok(kept)
  }
}

impl<M: DenseModel + Send + 'static> InferenceAdapter<M> {
  pub fn predict_dense(&self, tile: &Tile) -> Result<Array2<f32>, InferenceError> {
    self.run_bounded(tile, |model, input| {
      model.infer_dense(input).map_err(InferenceError::model)
    })
  }
}

mod stub;
pub use self::stub::{FixedModel, FixedModelError, FnModel};

#[cfg(feature = "model_threshold")]
mod threshold;
#[cfg(feature = "model_threshold")]
pub use self::threshold::{ThresholdModel, ThresholdModelError};

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("固定模型错误: {0}")]
  FixedModelError(#[from] FixedModelError),
  #[cfg(feature = "model_threshold")]
  #[error("阈值模型错误: {0}")]
  ThresholdModelError(#[from] ThresholdModelError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 按 URL 方案选择的模型后端
pub enum ModelWrapper {
  Fixed(FixedModel),
  #[cfg(feature = "model_threshold")]
  Threshold(ThresholdModel),
}

impl FromUrl for ModelWrapper {
  type Error = ModelError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "model_threshold")]
    {
      if url.scheme() == ThresholdModel::SCHEME {
        return Ok(ModelWrapper::Threshold(ThresholdModel::from_url(url)?));
      }
    }
    if url.scheme() == FixedModel::SCHEME {
      return Ok(ModelWrapper::Fixed(FixedModel::from_url(url)?));
    }
    error!("不支持的模型 URI: {}", url);
    Err(ModelError::SchemeMismatch)
  }
}

impl Model for ModelWrapper {
  type Error = ModelError;

  fn infer(&self, input: &ArrayView3<f32>) -> Result<Vec<Detection>, Self::Error> {
    match self {
      ModelWrapper::Fixed(model) => model.infer(input).map_err(|e| match e {}),
      #[cfg(feature = "model_threshold")]
      ModelWrapper::Threshold(model) => Ok(model.infer(input)?),
    }
  }
}

impl DenseModel for ModelWrapper {
  type Error = ModelError;

  fn infer_dense(&self, input: &ArrayView3<f32>) -> Result<Array2<f32>, Self::Error> {
    match self {
      ModelWrapper::Fixed(model) => model.infer_dense(input).map_err(|e| match e {}),
      #[cfg(feature = "model_threshold")]
      ModelWrapper::Threshold(model) => Ok(model.infer_dense(input)?),
    }
  }
}
