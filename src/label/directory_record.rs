// 该文件是 Tianhui （天绘） 项目的一部分。
// src/label/directory_record.rs - 目录标注存储
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

use chrono::{DateTime, Datelike, Utc};
use std::fs::File;
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::label::{LabelId, LabelRecord, LabelStore};
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum DirectoryLabelStoreError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("路径解码失败: {0}")]
  InvalidPath(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("计数器锁已失效")]
  Poisoned,
  #[error("标注文件已存在: {0}")]
  Collision(PathBuf),
}

/// 每条标注写成一个 JSON 文件：`<dir>/YYYY/MM/DD/HH-MM-SS-<id>.json`
///
/// id 接着目录中已有的最大 id 递增，首次写入时扫描目录确定起点。
pub struct DirectoryLabelStore {
  directory: PathBuf,
  label_counter: Mutex<Option<LabelId>>,
  pretty: bool,
}

impl FromUrlWithScheme for DirectoryLabelStore {
  const SCHEME: &'static str = "folder";
}

/// `folder:///path/to/labels[?pretty]`
impl FromUrl for DirectoryLabelStore {
  type Error = DirectoryLabelStoreError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryLabelStoreError::SchemeMismatch);
    }

    let path = urlencoding::decode(uri.path())
      .map_err(|e| DirectoryLabelStoreError::InvalidPath(e.to_string()))?
      .into_owned();
    let pretty = uri.query_pairs().any(|(k, _)| k == "pretty");

    Ok(DirectoryLabelStore::new(path).pretty(pretty))
  }
}

impl DirectoryLabelStore {
  pub fn new<P: AsRef<Path>>(directory: P) -> Self {
    Self {
      directory: directory.as_ref().to_path_buf(),
      label_counter: Mutex::new(None),
      pretty: false,
    }
  }

  pub fn pretty(mut self, pretty: bool) -> Self {
    self.pretty = pretty;
    self
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn label_id(&self) -> Result<LabelId, DirectoryLabelStoreError> {
    let mut counter = self
      .label_counter
      .lock()
      .map_err(|_| DirectoryLabelStoreError::Poisoned)?;
    let last = match *counter {
      Some(last) => last,
      None => self.last_label_id(),
    };
    let id = last + 1;
    *counter = Some(id);
    Ok(id)
  }

  /// 目录中已有标注的最大 id，文件名形如 `HH-MM-SS-<id>.json`
  fn last_label_id(&self) -> LabelId {
    let last = WalkDir::new(&self.directory)
      .min_depth(4)
      .max_depth(4)
      .into_iter()
      .filter_map(Result::ok)
      .filter_map(|entry| {
        let name = entry.file_name().to_str()?.strip_suffix(".json")?.to_string();
        let (_, id) = name.rsplit_once('-')?;
        LabelId::from_str_radix(id, 16).ok()
      })
      .max()
      .unwrap_or(0);
    if last > 0 {
      info!("{} 中已有标注, 从 {} 之后编号", self.directory.display(), last);
    }
    last
  }

  fn label_path(&self, id: LabelId, now: &DateTime<Utc>) -> Result<PathBuf, DirectoryLabelStoreError> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!("{}-{:08X}.json", now.format("%H-%M-%S"), id)))
  }
}

impl LabelStore for DirectoryLabelStore {
  type Error = DirectoryLabelStoreError;

  fn create(&self, record: &LabelRecord) -> Result<LabelId, Self::Error> {
    let id = self.label_id()?;
    let path = self.label_path(id, &record.created_at)?;
    let file = File::create_new(&path).map_err(|e| match e.kind() {
      ErrorKind::AlreadyExists => DirectoryLabelStoreError::Collision(path.clone()),
      _ => DirectoryLabelStoreError::IoError(e),
    })?;
    let writer = BufWriter::new(file);
    if self.pretty {
      serde_json::to_writer_pretty(writer, record)?;
    } else {
      serde_json::to_writer(writer, record)?;
    }
    debug!("标注 {} 写入 {}", id, path.display());
    Ok(id)
  }
}
