// 该文件是 Tianhui （天绘） 项目的一部分。
// src/label.rs - 类别表与标注持久化
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

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::feature::{FeatureCollection, GeoJsonFeature, Geometry, GeometryError};
use crate::geo::GeoBounds;

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryLabelStore, DirectoryLabelStoreError};

pub const DEFAULT_ZOOM_LEVEL: u8 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Color(pub u8, pub u8, pub u8);

impl Color {
  pub fn to_hex(&self) -> String {
    format!("#{:02X}{:02X}{:02X}", self.0, self.1, self.2)
  }
}

/// 标注形状；类别缺省为圆形，矢量化得到的标注一律为多边形
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LabelType {
  #[serde(rename = "R")]
  Rectangle,
  #[default]
  #[serde(rename = "C")]
  Circle,
  #[serde(rename = "P")]
  Polygon,
  #[serde(rename = "A")]
  Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
  pub id: u32,
  pub name: String,
  #[serde(default)]
  pub color: Option<Color>,
  #[serde(default)]
  pub label_type: LabelType,
}

impl Category {
  pub fn new(id: u32, name: impl Into<String>, color: Option<Color>) -> Self {
    Self {
      id,
      name: name.into(),
      color,
      label_type: LabelType::default(),
    }
  }
}

#[derive(Error, Debug)]
pub enum CatalogError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("类别表 JSON 无效: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("类别 id 重复: {0}")]
  DuplicateId(u32),
  #[error("类别名重复: {0}")]
  DuplicateName(String),
  #[error("类别 {0} 没有名称")]
  EmptyName(u32),
}

/// 只读的类别表，模型类别 id 与名称一一对应
///
/// 未指定颜色的类别使用构造时给定的默认颜色。
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryCatalog {
  categories: Vec<Category>,
  default_color: Color,
}

impl CategoryCatalog {
  pub fn new(categories: Vec<Category>, default_color: Color) -> Result<Self, CatalogError> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    let mut resolved = Vec::with_capacity(categories.len());
    for mut category in categories {
      if category.name.trim().is_empty() {
        return Err(CatalogError::EmptyName(category.id));
      }
      if !ids.insert(category.id) {
        return Err(CatalogError::DuplicateId(category.id));
      }
      if !names.insert(category.name.clone()) {
        return Err(CatalogError::DuplicateName(category.name));
      }
      category.color.get_or_insert(default_color);
      resolved.push(category);
    }
    Ok(Self {
      categories: resolved,
      default_color,
    })
  }

  /// `[{"id": 0, "name": "Buildings", "color": [255, 0, 0]}, ...]`
  pub fn from_json_str(json: &str, default_color: Color) -> Result<Self, CatalogError> {
    let categories: Vec<Category> = serde_json::from_str(json)?;
    Self::new(categories, default_color)
  }

  pub fn from_json_file<P: AsRef<Path>>(path: P, default_color: Color) -> Result<Self, CatalogError> {
    let json = std::fs::read_to_string(path.as_ref())?;
    let catalog = Self::from_json_str(&json, default_color)?;
    info!(
      "读取类别表 {}: {} 个类别",
      path.as_ref().display(),
      catalog.len()
    );
    Ok(catalog)
  }

  pub fn get(&self, id: u32) -> Option<&Category> {
    self.categories.iter().find(|c| c.id == id)
  }

  pub fn name_of(&self, id: u32) -> Option<&str> {
    self.get(id).map(|c| c.name.as_str())
  }

  pub fn by_name(&self, name: &str) -> Option<&Category> {
    self.categories.iter().find(|c| c.name == name)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Category> {
    self.categories.iter()
  }

  pub fn len(&self) -> usize {
    self.categories.len()
  }

  pub fn is_empty(&self) -> bool {
    self.categories.is_empty()
  }

  pub fn default_color(&self) -> Color {
    self.default_color
  }
}

/// 标注所属的栅格
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterRef {
  pub id: u64,
  pub name: String,
}

pub type LabelId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
  pub raster: RasterRef,
  pub category: Category,
  pub label_type: LabelType,
  pub geometry: Geometry,
  pub envelope: GeoBounds,
  pub zoom_level: u8,
  /// 生成该记录的原始 GeoJSON 要素
  pub label_json: GeoJsonFeature,
  pub created_at: DateTime<Utc>,
}

impl LabelRecord {
  pub fn northeast(&self) -> (f64, f64) {
    (self.envelope.max_x(), self.envelope.max_y())
  }

  pub fn southwest(&self) -> (f64, f64) {
    (self.envelope.min_x(), self.envelope.min_y())
  }
}

/// 标注记录的存储端
pub trait LabelStore {
  type Error: std::error::Error + Send + Sync + 'static;

  fn create(&self, record: &LabelRecord) -> Result<LabelId, Self::Error>;
}

#[derive(Error, Debug)]
pub enum MemoryLabelStoreError {
  #[error("存储锁已失效")]
  Poisoned,
}

/// 进程内存储，id 从 1 开始递增
#[derive(Debug, Default)]
pub struct MemoryLabelStore {
  records: Mutex<Vec<LabelRecord>>,
}

impl MemoryLabelStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn records(&self) -> Vec<LabelRecord> {
    self
      .records
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

impl LabelStore for MemoryLabelStore {
  type Error = MemoryLabelStoreError;

  fn create(&self, record: &LabelRecord) -> Result<LabelId, Self::Error> {
    let mut records = self
      .records
      .lock()
      .map_err(|_| MemoryLabelStoreError::Poisoned)?;
    records.push(record.clone());
    Ok(records.len() as LabelId)
  }
}

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("类别 '{0}' 不在类别表中")]
  UnknownCategory(String),
  #[error("几何无效: {0}")]
  InvalidGeometry(#[from] GeometryError),
  #[error("存储失败: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug)]
pub struct PersistFailure {
  /// 要素在集合中的序号
  pub index: usize,
  pub error: LabelError,
}

impl PersistFailure {
  pub fn reason(&self) -> String {
    self.error.to_string()
  }
}

#[derive(Debug, Default)]
pub struct PersistReport {
  pub created: Vec<LabelId>,
  pub failures: Vec<PersistFailure>,
}

impl PersistReport {
  pub fn is_complete(&self) -> bool {
    self.failures.is_empty()
  }
}

fn build_record(
  feature: &GeoJsonFeature,
  raster: &RasterRef,
  catalog: &CategoryCatalog,
) -> Result<LabelRecord, LabelError> {
  let category = catalog
    .by_name(&feature.properties.category)
    .ok_or_else(|| LabelError::UnknownCategory(feature.properties.category.clone()))?;
  let envelope = feature.geometry.validate()?;
  Ok(LabelRecord {
    raster: raster.clone(),
    category: category.clone(),
    label_type: LabelType::Polygon,
    geometry: feature.geometry.clone(),
    envelope,
    zoom_level: DEFAULT_ZOOM_LEVEL,
    label_json: feature.clone(),
    created_at: Utc::now(),
  })
}

/// 逐个要素写入存储，单个要素失败不影响其余要素
pub fn persist<S: LabelStore>(
  collection: &FeatureCollection,
  raster: &RasterRef,
  catalog: &CategoryCatalog,
  store: &S,
) -> PersistReport {
  let mut report = PersistReport::default();
  for (index, feature) in collection.features.iter().enumerate() {
    let result = build_record(feature, raster, catalog).and_then(|record| {
      store
        .create(&record)
        .map_err(|e| LabelError::Store(Box::new(e)))
    });
    match result {
      Ok(id) => {
        debug!("要素 {} 保存为标注 {}", index, id);
        report.created.push(id);
      }
      Err(error) => {
        warn!("要素 {} 保存失败: {}", index, error);
        report.failures.push(PersistFailure { index, error });
      }
    }
  }
  info!(
    "栅格 {} ({}): 保存 {} 个标注, 失败 {}",
    raster.name,
    raster.id,
    report.created.len(),
    report.failures.len()
  );
  report
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::feature::{Feature, Properties};

  fn catalog() -> CategoryCatalog {
    CategoryCatalog::from_json_str(
      r#"[{"id": 0, "name": "Buildings", "color": [255, 0, 0]}, {"id": 1, "name": "Trees"}]"#,
      Color(0, 0, 0),
    )
    .unwrap()
  }

  fn raster() -> RasterRef {
    RasterRef {
      id: 3,
      name: "campus".to_string(),
    }
  }

  fn square(category_id: u32) -> Feature {
    Feature::new(
      vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)],
      category_id,
      0.9,
    )
  }

  struct FailingStore;

  impl LabelStore for FailingStore {
    type Error = std::io::Error;

    fn create(&self, _record: &LabelRecord) -> Result<LabelId, Self::Error> {
      Err(std::io::Error::other("disk full"))
    }
  }

  #[test]
  fn label_types_follow_their_defaults() {
    let catalog = catalog();
    assert_eq!(catalog.get(1).unwrap().label_type, LabelType::Circle);

    let collection = FeatureCollection::from_features(&[square(1)], &catalog);
    let store = MemoryLabelStore::new();
    persist(&collection, &raster(), &catalog, &store);
    let record = store.records().remove(0);
    assert_eq!(record.label_type, LabelType::Polygon);
    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["label_type"], "P");
  }

  #[test]
  fn catalog_fills_default_color() {
    let catalog = catalog();
    assert_eq!(catalog.len(), 2);
    assert_eq!(catalog.name_of(1), Some("Trees"));
    assert_eq!(catalog.by_name("Trees").unwrap().color, Some(Color(0, 0, 0)));
    assert_eq!(catalog.get(0).unwrap().color.unwrap().to_hex(), "#FF0000");
    assert!(catalog.by_name("trees").is_none());
  }

  #[test]
  fn catalog_rejects_duplicates() {
    let dup = vec![Category::new(0, "A", None), Category::new(0, "B", None)];
    assert!(matches!(
      CategoryCatalog::new(dup, Color::default()),
      Err(CatalogError::DuplicateId(0))
    ));
    let dup = vec![Category::new(0, "A", None), Category::new(1, "A", None)];
    assert!(matches!(
      CategoryCatalog::new(dup, Color::default()),
      Err(CatalogError::DuplicateName(_))
    ));
  }

  #[test]
  fn persist_resolves_categories_by_name() {
    let catalog = catalog();
    let collection = FeatureCollection::from_features(&[square(0), square(7), square(1)], &catalog);
    let store = MemoryLabelStore::new();
    let report = persist(&collection, &raster(), &catalog, &store);
    assert_eq!(report.created, vec![1, 2]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].index, 1);
    assert!(matches!(report.failures[0].error, LabelError::UnknownCategory(ref n) if n == "unknown"));
    assert!(!report.is_complete());

    let records = store.records();
    assert_eq!(records[0].category.name, "Buildings");
    assert_eq!(records[1].category.name, "Trees");
    assert_eq!(records[0].northeast(), (1.0, 1.0));
    assert_eq!(records[0].southwest(), (0.0, 0.0));
    assert_eq!(records[0].label_type, LabelType::Polygon);
    assert_eq!(records[0].raster, raster());
  }

  #[test]
  fn malformed_geometry_fails_alone() {
    let catalog = catalog();
    let mut collection = FeatureCollection::from_features(&[square(0), square(1)], &catalog);
    collection.features[0].geometry = Geometry::Polygon {
      coordinates: vec![vec![[0.0, 0.0], [1.0, 1.0]]],
    };
    let report = persist(&collection, &raster(), &catalog, &MemoryLabelStore::new());
    assert_eq!(report.created.len(), 1);
    assert!(matches!(report.failures[0].error, LabelError::InvalidGeometry(_)));
  }

  #[test]
  fn store_errors_are_reported_per_feature() {
    let catalog = catalog();
    let collection = FeatureCollection {
      features: vec![GeoJsonFeature {
        kind: "Feature".to_string(),
        geometry: Geometry::polygon(&[(0.0, 0.0), (2.0, 0.0), (2.0, 2.0)]),
        properties: Properties {
          category: "Trees".to_string(),
          confidence: 0.7,
        },
        bbox: None,
      }],
      ..Default::default()
    };
    let report = persist(&collection, &raster(), &catalog, &FailingStore);
    assert!(report.created.is_empty());
    assert!(report.failures[0].reason().contains("disk full"));
  }
}
