// 该文件是 Tianhui （天绘） 项目的一部分。
// tests/pipeline.rs - 流水线集成测试
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

use std::fmt;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use ndarray::{Array3, ArrayView3};

use tianhui::config::PipelineConfig;
use tianhui::feature::{DEFAULT_DEDUP_OVERLAP, Feature, FeatureCollection, collect};
use tianhui::geo::{AffineTransform, GeoBounds};
use tianhui::label::{Category, CategoryCatalog, Color, LabelError, MemoryLabelStore, RasterRef, persist};
use tianhui::model::{Detection, FixedModel, FnModel, InferenceError};
use tianhui::pipeline::{Pipeline, TileFailureCause};
use tianhui::raster::GeoRaster;

const ORIGIN_X: f64 = -111.93;
const ORIGIN_Y: f64 = 33.42;
const PIXEL: f64 = 1e-5;

#[derive(Debug)]
struct SensorFault;

impl fmt::Display for SensorFault {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "sensor fault")
  }
}

impl std::error::Error for SensorFault {}

fn raster(size: usize, fill: impl Fn(usize, usize) -> f32) -> GeoRaster {
  let data = Array3::from_shape_fn((1, size, size), |(_, r, c)| fill(r, c));
  GeoRaster::new(data, AffineTransform::north_up(ORIGIN_X, ORIGIN_Y, PIXEL, PIXEL).unwrap())
}

fn config() -> PipelineConfig {
  PipelineConfig {
    tile_size: 128,
    overlap: 32,
    ..Default::default()
  }
}

fn catalog() -> CategoryCatalog {
  CategoryCatalog::new(vec![Category::new(1, "Buildings", None)], Color(255, 0, 0)).unwrap()
}

fn site() -> RasterRef {
  RasterRef {
    id: 42,
    name: "campus".to_string(),
  }
}

fn boxes_at(local: [f32; 4], category_id: u32) -> impl Fn(&ArrayView3<f32>) -> Result<Vec<Detection>, SensorFault> {
  move |input| {
    if input.iter().any(|&v| v > 2.0) {
      return Err(SensorFault);
    }
    Ok(vec![Detection::from_box(local, 0.9, category_id)])
  }
}

#[cfg(feature = "model_threshold")]
#[test]
fn object_seen_by_four_tiles_is_saved_once() {
  use tianhui::model::ThresholdModel;

  let raster = raster(200, |r, c| {
    if (90..110).contains(&r) && (90..110).contains(&c) { 1.0 } else { 0.0 }
  });
  let pipeline = Pipeline::new(ThresholdModel::new(0, 0.5, 1), config()).unwrap();
  let bounds = raster.bounds().unwrap();
  let prediction = pipeline.predict(&raster, Some(&bounds), &catalog()).unwrap();

  assert_eq!(prediction.report.tiles, 4);
  assert!(prediction.is_complete());
  assert_eq!(prediction.features.len(), 1);
  let envelope = prediction.features[0].envelope().unwrap();
  assert!((envelope.min_x() - (ORIGIN_X + 90.0 * PIXEL)).abs() < 1e-9);
  assert!((envelope.max_x() - (ORIGIN_X + 110.0 * PIXEL)).abs() < 1e-9);
  assert!((envelope.max_y() - (ORIGIN_Y - 90.0 * PIXEL)).abs() < 1e-9);
  assert!((envelope.min_y() - (ORIGIN_Y - 110.0 * PIXEL)).abs() < 1e-9);

  let store = MemoryLabelStore::new();
  let report = persist(&prediction.collection, &site(), &catalog(), &store);
  assert_eq!(report.created.len(), 1);
  assert!(report.is_complete());
  assert_eq!(store.records()[0].category.name, "Buildings");
  assert_eq!(store.records()[0].raster.id, 42);
}

fn near(a: f64, b: f64) -> bool {
  (a - b).abs() < 1e-9
}

#[test]
fn overlapping_pair_from_neighbouring_tiles_persists_once() {
  let square = |x: f64| {
    vec![
      (x, 0.0),
      (x + 10.0, 0.0),
      (x + 10.0, 10.0),
      (x, 10.0),
    ]
  };
  // 两块各自报告同一目标，外包框重叠 70%
  let left = Feature::new(square(0.0), 1, 0.87).with_tile_index(0);
  let right = Feature::new(square(3.0), 1, 0.91).with_tile_index(1);
  let features = collect(vec![vec![left], vec![right]], DEFAULT_DEDUP_OVERLAP);
  let collection = FeatureCollection::from_features(&features, &catalog());

  let store = MemoryLabelStore::new();
  let report = persist(&collection, &site(), &catalog(), &store);
  assert_eq!(report.created.len(), 1);
  assert!(report.is_complete());
  let record = &store.records()[0];
  assert_eq!(record.label_json.properties.confidence, 0.91);
  assert!(near(record.envelope.min_x(), 3.0));
}

#[test]
fn fixed_local_detection_lands_once_per_tile() {
  // 每块在相同的局部位置返回 20x20 掩膜；块间距 72 像素，彼此不重叠
  let model = FixedModel::new(vec![Detection::from_box([54.0, 54.0, 74.0, 74.0], 0.9, 1)]);
  let raster = raster(200, |_, _| 0.0);
  let pipeline = Pipeline::new(model, config()).unwrap();
  let prediction = pipeline.predict(&raster, None, &catalog()).unwrap();
  assert!(prediction.is_complete());
  assert_eq!(prediction.features.len(), 4);

  let mut corners: Vec<(f64, f64)> = prediction
    .features
    .iter()
    .map(|f| {
      let env = f.envelope().unwrap();
      (
        ((env.min_x() - ORIGIN_X) / PIXEL).round(),
        ((ORIGIN_Y - env.max_y()) / PIXEL).round(),
      )
    })
    .collect();
  corners.sort_by(|a, b| a.partial_cmp(b).unwrap());
  assert_eq!(corners, vec![(54.0, 54.0), (54.0, 126.0), (126.0, 54.0), (126.0, 126.0)]);

  let store = MemoryLabelStore::new();
  let report = persist(&prediction.collection, &site(), &catalog(), &store);
  assert_eq!(report.created.len(), 4);
}

#[test]
fn anchored_20px_detection_seen_by_every_tile_persists_once() {
  // 掩膜固定 20x20，锚定在块内目标的左上角
  let model = FnModel::new(|input| -> Result<Vec<Detection>, SensorFault> {
    let (_, height, width) = input.dim();
    for r in 0..height {
      for c in 0..width {
        if input[[0, r, c]] > 0.5 {
          let (x, y) = (c as f32, r as f32);
          return Ok(vec![Detection::from_box([x, y, x + 20.0, y + 20.0], 0.9, 1)]);
        }
      }
    }
    Ok(vec![])
  });
  let raster = raster(200, |r, c| {
    if (90..110).contains(&r) && (90..110).contains(&c) { 1.0 } else { 0.0 }
  });
  let pipeline = Pipeline::new(model, config()).unwrap();
  let prediction = pipeline.predict(&raster, None, &catalog()).unwrap();
  assert_eq!(prediction.report.tiles, 4);
  assert_eq!(prediction.features.len(), 1);
  assert_eq!(prediction.features[0].tile_index, 0);

  let store = MemoryLabelStore::new();
  let report = persist(&prediction.collection, &site(), &catalog(), &store);
  assert_eq!(report.created.len(), 1);
  let envelope = store.records()[0].envelope;
  assert!(near(envelope.min_x(), ORIGIN_X + 90.0 * PIXEL));
  assert!(near(envelope.max_y(), ORIGIN_Y - 90.0 * PIXEL));
  assert!(near(envelope.max_x(), ORIGIN_X + 110.0 * PIXEL));
  assert!(near(envelope.min_y(), ORIGIN_Y - 110.0 * PIXEL));
}

#[test]
fn nested_instances_in_one_tile_are_both_kept() {
  let model = FnModel::new(|_| -> Result<Vec<Detection>, SensorFault> {
    Ok(vec![
      Detection::from_box([10.0, 10.0, 60.0, 60.0], 0.9, 1),
      Detection::from_box([20.0, 20.0, 30.0, 30.0], 0.8, 1),
    ])
  });
  let pipeline = Pipeline::new(model, config()).unwrap();
  let prediction = pipeline.predict(&raster(100, |_, _| 0.0), None, &catalog()).unwrap();
  assert_eq!(prediction.report.tiles, 1);
  assert_eq!(prediction.features.len(), 2);
}

#[test]
fn unknown_category_fails_alone() {
  let raster = raster(100, |_, _| 0.0);
  let model = FnModel::new(|_| -> Result<Vec<Detection>, SensorFault> {
    Ok(vec![
      Detection::from_box([10.0, 10.0, 30.0, 30.0], 0.95, 1),
      Detection::from_box([50.0, 50.0, 70.0, 70.0], 0.8, 9),
      Detection::from_box([80.0, 10.0, 90.0, 20.0], 0.3, 1),
    ])
  });
  let pipeline = Pipeline::new(model, config()).unwrap();
  let prediction = pipeline.predict(&raster, None, &catalog()).unwrap();
  assert_eq!(prediction.report.tiles, 1);
  // 低于置信度阈值的检测被丢弃
  assert_eq!(prediction.collection.len(), 2);

  let store = MemoryLabelStore::new();
  let report = persist(&prediction.collection, &site(), &catalog(), &store);
  assert_eq!(report.created.len(), 1);
  assert_eq!(report.failures.len(), 1);
  assert!(matches!(report.failures[0].error, LabelError::UnknownCategory(_)));
}

#[test]
fn failed_tile_does_not_abort_the_rest() {
  let raster = raster(200, |r, c| if r == 190 && c == 190 { 5.0 } else { 0.0 });
  let model = FnModel::new(boxes_at([10.0, 10.0, 30.0, 30.0], 1));
  let pipeline = Pipeline::new(model, config()).unwrap();
  let prediction = pipeline.predict(&raster, None, &catalog()).unwrap();

  assert!(!prediction.is_complete());
  assert_eq!(prediction.report.processed, 3);
  assert_eq!(prediction.report.failures.len(), 1);
  let failure = &prediction.report.failures[0];
  assert_eq!(failure.index, 3);
  assert_eq!((failure.window.col_off, failure.window.row_off), (72, 72));
  assert!(matches!(failure.cause, TileFailureCause::Inference(InferenceError::Model(_))));
  assert_eq!(prediction.features.len(), 3);
  let mut tiles: Vec<usize> = prediction.features.iter().map(|f| f.tile_index).collect();
  tiles.sort();
  assert_eq!(tiles, vec![0, 1, 2]);
}

#[test]
fn abort_on_error_skips_remaining_tiles() {
  let raster = raster(200, |_, _| 9.0);
  let model = FnModel::new(boxes_at([10.0, 10.0, 30.0, 30.0], 1));
  let mut config = config();
  config.abort_on_tile_error = true;
  let pipeline = Pipeline::new(model, config).unwrap();
  let prediction = pipeline.predict(&raster, None, &catalog()).unwrap();
  assert!(!prediction.is_complete());
  assert_eq!(prediction.report.failures.len() + prediction.report.skipped.len(), 4);
  assert!(!prediction.report.failures.is_empty());
  assert!(prediction.features.is_empty());
}

#[test]
fn abort_does_not_leak_into_the_next_call() {
  let model = FnModel::new(boxes_at([10.0, 10.0, 30.0, 30.0], 1));
  let mut config = config();
  config.abort_on_tile_error = true;
  let pipeline = Pipeline::new(model, config).unwrap();

  let failed = pipeline.predict(&raster(200, |_, _| 9.0), None, &catalog()).unwrap();
  assert!(!failed.is_complete());
  assert!(!pipeline.stop_handle().load(Ordering::SeqCst));

  let clean = pipeline.predict(&raster(200, |_, _| 0.0), None, &catalog()).unwrap();
  assert!(clean.is_complete());
  assert_eq!(clean.report.processed, 4);
  assert_eq!(clean.features.len(), 4);
}

#[test]
fn panicking_tile_is_recorded_as_failure() {
  let model = FnModel::new(|input| -> Result<Vec<Detection>, SensorFault> {
    if input.iter().any(|&v| v > 2.0) {
      panic!("driver crashed");
    }
    Ok(vec![Detection::from_box([10.0, 10.0, 30.0, 30.0], 0.9, 1)])
  });
  let raster = raster(200, |r, c| if r == 190 && c == 190 { 5.0 } else { 0.0 });
  let pipeline = Pipeline::new(model, config()).unwrap();
  let prediction = pipeline.predict(&raster, None, &catalog()).unwrap();
  assert_eq!(prediction.report.processed, 3);
  assert_eq!(prediction.report.failures.len(), 1);
  assert!(matches!(
    prediction.report.failures[0].cause,
    TileFailureCause::Inference(InferenceError::WorkerLost)
  ));
}

#[test]
fn stop_handle_prevents_new_tiles() {
  let raster = raster(200, |_, _| 0.0);
  let model = FnModel::new(boxes_at([10.0, 10.0, 30.0, 30.0], 1));
  let pipeline = Pipeline::new(model, config()).unwrap();
  pipeline.stop_handle().store(true, Ordering::SeqCst);
  let prediction = pipeline.predict(&raster, None, &catalog()).unwrap();
  assert_eq!(prediction.report.skipped.len(), 4);
  assert!(prediction.collection.is_empty());
  assert!(!prediction.is_complete());
}

#[test]
fn slow_model_times_out_per_tile() {
  let raster = raster(64, |_, _| 0.0);
  let model = FnModel::new(|_| -> Result<Vec<Detection>, SensorFault> {
    thread::sleep(Duration::from_millis(200));
    Ok(vec![])
  });
  let config = PipelineConfig {
    inference_timeout_ms: Some(10),
    ..config()
  };
  let pipeline = Pipeline::new(model, config).unwrap();
  let prediction = pipeline.predict(&raster, None, &catalog()).unwrap();
  assert_eq!(prediction.report.failures.len(), 1);
  assert!(matches!(
    prediction.report.failures[0].cause,
    TileFailureCause::Inference(InferenceError::Timeout(_))
  ));
}

#[test]
fn bounds_outside_raster_abort() {
  let raster = raster(100, |_, _| 0.0);
  let model = FnModel::new(boxes_at([10.0, 10.0, 30.0, 30.0], 1));
  let pipeline = Pipeline::new(model, config()).unwrap();
  let far = GeoBounds::new(0.0, 0.0, 1.0, 1.0).unwrap();
  assert!(pipeline.predict(&raster, Some(&far), &catalog()).is_err());
}

#[test]
fn invalid_configuration_is_rejected() {
  let model = FnModel::new(boxes_at([10.0, 10.0, 30.0, 30.0], 1));
  let config = PipelineConfig {
    tile_size: 64,
    overlap: 64,
    ..Default::default()
  };
  assert!(Pipeline::new(model, config).is_err());
}

#[cfg(feature = "model_threshold")]
#[test]
fn dense_predictions_stitch_back_to_the_band() {
  use tianhui::model::ThresholdModel;

  let raster = raster(200, |r, c| ((r * 3 + c * 7) % 100) as f32 / 100.0);
  let pipeline = Pipeline::new(ThresholdModel::new(0, 0.5, 1), config()).unwrap();
  let bounds = GeoBounds::new(
    ORIGIN_X + 20.0 * PIXEL,
    ORIGIN_Y - 180.0 * PIXEL,
    ORIGIN_X + 170.0 * PIXEL,
    ORIGIN_Y - 10.0 * PIXEL,
  )
  .unwrap();
  let prediction = pipeline.predict_dense(&raster, Some(&bounds)).unwrap();

  assert!(prediction.is_complete());
  let window = prediction.window;
  assert_eq!((window.col_off, window.row_off, window.width, window.height), (20, 10, 150, 170));
  assert_eq!(prediction.values.dim(), (170, 150));
  for ((r, c), &v) in prediction.values.indexed_iter() {
    let expected = raster.view()[[0, r + 10, c + 20]];
    assert!((v - expected).abs() < 1e-5, "({r}, {c}): {v} != {expected}");
  }
  let (x, y) = prediction.transform.apply(0.0, 0.0);
  assert!((x - (ORIGIN_X + 20.0 * PIXEL)).abs() < 1e-12);
  assert!((y - (ORIGIN_Y - 10.0 * PIXEL)).abs() < 1e-12);
}
