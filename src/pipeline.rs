// 该文件是 Tianhui （天绘） 项目的一部分。
// src/pipeline.rs - 分块推理流水线
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
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use ndarray::Array2;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::feature::{Feature, FeatureCollection, collect};
use crate::geo::{AffineTransform, GeoBounds, GeoError, OutputExtent, RasterWindow, compose};
use crate::label::CategoryCatalog;
use crate::model::{DenseModel, InferenceAdapter, InferenceError, Model};
use crate::raster::GeoRaster;
use crate::stitch::{StitchError, Stitcher};
use crate::tile::{Tile, TileError, tile_raster};
use crate::vectorize::vectorize;

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("地理参考错误: {0}")]
  Geo(#[from] GeoError),
  #[error("分块错误: {0}")]
  Tile(#[from] TileError),
  #[error("推理设置错误: {0}")]
  Inference(#[from] InferenceError),
  #[error("拼接错误: {0}")]
  Stitch(#[from] StitchError),
}

#[derive(Error, Debug)]
pub enum TileFailureCause {
  #[error(transparent)]
  Inference(#[from] InferenceError),
  #[error(transparent)]
  Stitch(#[from] StitchError),
}

#[derive(Debug)]
pub struct TileFailure {
  pub index: usize,
  /// 在父栅格中的位置
  pub window: RasterWindow,
  pub cause: TileFailureCause,
}

/// 单次运行的分块统计
#[derive(Debug, Default)]
pub struct TileReport {
  pub tiles: usize,
  pub processed: usize,
  pub failures: Vec<TileFailure>,
  /// 停止信号或中止之后未发出的块
  pub skipped: Vec<usize>,
  /// 面积不足、未生成要素的掩膜数
  pub empty_masks: usize,
}

impl TileReport {
  pub fn is_complete(&self) -> bool {
    self.failures.is_empty() && self.skipped.is_empty()
  }
}

#[derive(Debug)]
pub struct Prediction {
  pub window: RasterWindow,
  /// 去重后的要素，按保留顺序
  pub features: Vec<Feature>,
  pub collection: FeatureCollection,
  pub report: TileReport,
}

impl Prediction {
  pub fn is_complete(&self) -> bool {
    self.report.is_complete()
  }
}

#[derive(Debug)]
pub struct DensePrediction {
  pub window: RasterWindow,
  pub values: Array2<f32>,
  /// 输出像素 → 地理坐标
  pub transform: AffineTransform,
  pub report: TileReport,
}

impl DensePrediction {
  pub fn is_complete(&self) -> bool {
    self.report.is_complete()
  }
}

enum TileOutcome<T> {
  Done(T),
  Failed(TileFailure),
  Skipped(usize),
}

pub struct Pipeline<M> {
  adapter: InferenceAdapter<M>,
  config: PipelineConfig,
  stop: Arc<AtomicBool>,
}

impl<M: Send + 'static> Pipeline<M> {
  pub fn new(model: M, config: PipelineConfig) -> Result<Self, PipelineError> {
    config.validate()?;
    let adapter = InferenceAdapter::new(model)
      .with_threshold(config.confidence_threshold)?
      .with_timeout(config.inference_timeout());
    Ok(Self {
      adapter,
      config,
      stop: Arc::new(AtomicBool::new(false)),
    })
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  /// 置位后不再发出新的块，正在推理的块照常完成
  pub fn stop_handle(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.stop)
  }

  fn resolve_window(&self, raster: &GeoRaster, bounds: Option<&GeoBounds>) -> Result<RasterWindow, PipelineError> {
    let window = match (bounds, self.config.default_window) {
      (Some(bounds), _) => raster.window_from_bounds(bounds)?,
      (None, Some(window)) => window.intersect(&raster.full_window()).ok_or_else(|| {
        TileError::OutOfRasterBounds(format!(
          "默认窗口 {:?} 与 {}x{} 栅格无交集",
          window,
          raster.width(),
          raster.height()
        ))
      })?,
      (None, None) => raster.full_window(),
    };
    Ok(window)
  }

  fn prepare_tiles(&self, raster: &GeoRaster, window: &RasterWindow) -> Result<Vec<Tile>, PipelineError> {
    let tiles = tile_raster(raster, window, self.config.tile_size, self.config.overlap)?;
    let Some(normalization) = &self.config.normalization else {
      return Ok(tiles);
    };
    Ok(
      tiles
        .into_iter()
        .map(|tile| {
          let data = normalization.apply(&tile.data().view());
          Tile::new(tile.index(), data, *tile.transform(), *tile.window())
        })
        .collect(),
    )
  }

  fn run_tiles<T, F>(&self, tiles: &[Tile], work: F) -> (Vec<T>, TileReport)
  where
    T: Send,
    F: Fn(&Tile) -> Result<T, TileFailureCause> + Sync,
  {
    // 只在本次调用内有效，外部停止信号由调用方掌控
    let aborted = AtomicBool::new(false);
    let outcomes: Vec<TileOutcome<T>> = tiles
      .par_iter()
      .map(|tile| {
        if self.stop.load(Ordering::SeqCst) || aborted.load(Ordering::SeqCst) {
          return TileOutcome::Skipped(tile.index());
        }
        match work(tile) {
          Ok(value) => TileOutcome::Done(value),
          Err(cause) => {
            error!("第 {} 块处理失败: {}", tile.index(), cause);
            if self.config.abort_on_tile_error {
              warn!("停止发出新的块");
              aborted.store(true, Ordering::SeqCst);
            }
            TileOutcome::Failed(TileFailure {
              index: tile.index(),
              window: *tile.window(),
              cause,
            })
          }
        }
      })
      .collect();

    let mut report = TileReport {
      tiles: tiles.len(),
      ..Default::default()
    };
    let mut values = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
      match outcome {
        TileOutcome::Done(value) => {
          report.processed += 1;
          values.push(value);
        }
        TileOutcome::Failed(failure) => report.failures.push(failure),
        TileOutcome::Skipped(index) => report.skipped.push(index),
      }
    }
    if !report.skipped.is_empty() {
      warn!("已停止, 跳过 {} 块", report.skipped.len());
    }
    (values, report)
  }
}

impl<M: Model + Send + 'static> Pipeline<M> {
  /// 地理范围 → 去重后的要素集合；`bounds` 为空时使用默认窗口
  pub fn predict(
    &self,
    raster: &GeoRaster,
    bounds: Option<&GeoBounds>,
    catalog: &CategoryCatalog,
  ) -> Result<Prediction, PipelineError> {
    let window = self.resolve_window(raster, bounds)?;
    let tiles = self.prepare_tiles(raster, &window)?;
    info!("开始预测: 窗口 {:?}, 共 {} 块", window, tiles.len());
    let now = Instant::now();

    let options = self.config.vectorize_options();
    let (per_tile, mut report) = self.run_tiles(&tiles, |tile| {
      let detections = self.adapter.predict(tile)?;
      let mut features = Vec::new();
      let mut empty_masks = 0usize;
      for detection in &detections {
        match vectorize(detection, tile.transform(), &options) {
          Ok(found) => features.extend(found.into_iter().map(|f| f.with_tile_index(tile.index()))),
          Err(e) => {
            debug!("第 {} 块: {}", tile.index(), e);
            empty_masks += 1;
          }
        }
      }
      Ok((features, empty_masks))
    });

    report.empty_masks = per_tile.iter().map(|(_, empty)| empty).sum();
    let candidates: Vec<Vec<Feature>> = per_tile.into_iter().map(|(features, _)| features).collect();
    let total: usize = candidates.iter().map(Vec::len).sum();
    let features = collect(candidates, self.config.dedup_overlap);
    let collection = FeatureCollection::from_features(&features, catalog);

    info!(
      "预测完成, 耗时 {:.2?}: {} 个候选要素, 去重后 {}, 空掩膜 {}, 失败 {} 块",
      now.elapsed(),
      total,
      features.len(),
      report.empty_masks,
      report.failures.len()
    );
    Ok(Prediction {
      window,
      features,
      collection,
      report,
    })
  }
}

impl<M: DenseModel + Send + 'static> Pipeline<M> {
  /// 逐块稠密预测并拼接为窗口大小的单幅栅格
  pub fn predict_dense(&self, raster: &GeoRaster, bounds: Option<&GeoBounds>) -> Result<DensePrediction, PipelineError> {
    let window = self.resolve_window(raster, bounds)?;
    let tiles = self.prepare_tiles(raster, &window)?;
    info!("开始稠密预测: 窗口 {:?}, 共 {} 块", window, tiles.len());
    let now = Instant::now();

    let stitcher = Stitcher::new(window.height, window.width, self.config.overlap);
    let (_, report) = self.run_tiles(&tiles, |tile| {
      let values = self.adapter.predict_dense(tile)?;
      let placement = tile.window();
      let local = RasterWindow::new(
        placement.col_off - window.col_off,
        placement.row_off - window.row_off,
        placement.width,
        placement.height,
      );
      stitcher.add(&values.view(), &local)?;
      Ok(())
    });
    let values = stitcher.finish()?;

    info!(
      "拼接完成, 耗时 {:.2?}: {}x{}, 失败 {} 块",
      now.elapsed(),
      window.width,
      window.height,
      report.failures.len()
    );
    Ok(DensePrediction {
      window,
      values,
      transform: compose(raster.transform(), &OutputExtent::Window(window))?,
      report,
    })
  }
}
