//! 版本化文件存储
//!
//! 每个 (文件组, 设备) 保存一串按版本号递增的快照，超过 `files_max_count`
//! 时淘汰最旧的版本。磁盘布局为 `{root}/{filegroup}/{device}/{generation}.txt`，
//! 另有一个 `index.json` 作为索引缓存，启动时从目录树重建。

mod diff;
mod index;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fleetd_core::{EngineError, EngineResult};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use diff::line_diff;
pub use index::{ArtifactEntry, ArtifactIndex};
use index::{relative_path, INDEX_FILE};

/// 读取时的版本选择
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSelector {
    /// 最新版本
    Last,
    /// 最新的N个版本（从新到旧）
    LastN(usize),
    /// 按新旧位置选择，1为最新、2为次新，依此类推
    Recent(Vec<usize>),
    /// 按绝对版本号选择
    Generations(Vec<u64>),
}

/// 读取到的快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub filegroup: String,
    pub device: String,
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

pub struct ArtifactStore {
    root: PathBuf,
    files_max_count: usize,
    index: ArtifactIndex,
}

impl ArtifactStore {
    /// 打开存储目录并从目录树重建索引
    pub async fn open(root: impl Into<PathBuf>, files_max_count: usize) -> EngineResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(EngineError::artifact(&root))?;
        let mut index = ArtifactIndex::rebuild(&root).await?;
        if let Some(previous) = ArtifactIndex::load(&root).await {
            index.restore_high_water(&previous);
        }
        let store = Self {
            root,
            files_max_count: files_max_count.max(1),
            index,
        };
        store.persist_index().await?;
        info!(
            "文件存储已打开: {}（{} 个版本）",
            store.root.display(),
            store.index.total_entries()
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files_max_count(&self) -> usize {
        self.files_max_count
    }

    /// 保存新版本，返回版本号
    pub async fn save(
        &mut self,
        filegroup: &str,
        device: &str,
        content: &str,
    ) -> EngineResult<u64> {
        validate_name(filegroup)?;
        validate_name(device)?;

        let generation = self.index.next_generation(filegroup, device);
        let relative = relative_path(filegroup, device, generation);
        let path = self.root.join(&relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(EngineError::artifact(parent))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(EngineError::artifact(&path))?;

        self.index.record_generation(filegroup, device, generation);
        let max = self.files_max_count;
        let series = self.index.series_mut(filegroup, device);
        series.push(ArtifactEntry {
            generation,
            path: relative,
            timestamp: Utc::now(),
            size: content.len() as u64,
        });

        let excess = series.len().saturating_sub(max);
        let evicted: Vec<ArtifactEntry> = series.drain(..excess).collect();
        for entry in &evicted {
            remove_file_if_exists(&self.root.join(&entry.path)).await?;
            debug!(
                "淘汰旧版本: {}/{} 第 {} 版",
                filegroup, device, entry.generation
            );
        }

        self.persist_index().await?;
        counter!("fleetd_artifacts_saved_total").increment(1);
        if !evicted.is_empty() {
            counter!("fleetd_artifacts_evicted_total").increment(evicted.len() as u64);
        }
        debug!("保存文件: {}/{} 第 {} 版", filegroup, device, generation);
        Ok(generation)
    }

    /// 读取快照，结果按从新到旧排列；不存在的文件组或设备返回空列表
    pub async fn read(
        &self,
        filegroup: &str,
        device: &str,
        selector: &ArtifactSelector,
    ) -> EngineResult<Vec<Artifact>> {
        let series = self.index.series(filegroup, device);
        let newest_first = series.iter().rev();
        let selected: Vec<&ArtifactEntry> = match selector {
            ArtifactSelector::Last => newest_first.take(1).collect(),
            ArtifactSelector::LastN(n) => newest_first.take(*n).collect(),
            ArtifactSelector::Recent(positions) => positions
                .iter()
                .filter_map(|&pos| pos.checked_sub(1).and_then(|i| series.iter().rev().nth(i)))
                .collect(),
            ArtifactSelector::Generations(generations) => generations
                .iter()
                .filter_map(|g| series.iter().find(|e| e.generation == *g))
                .collect(),
        };

        let mut artifacts = Vec::with_capacity(selected.len());
        for entry in selected {
            let path = self.root.join(&entry.path);
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(EngineError::artifact(&path))?;
            artifacts.push(Artifact {
                filegroup: filegroup.to_string(),
                device: device.to_string(),
                generation: entry.generation,
                timestamp: entry.timestamp,
                content,
            });
        }
        Ok(artifacts)
    }

    /// 最新版本
    pub async fn read_last(&self, filegroup: &str, device: &str) -> EngineResult<Option<Artifact>> {
        Ok(self
            .read(filegroup, device, &ArtifactSelector::Last)
            .await?
            .into_iter()
            .next())
    }

    pub fn list(&self, filegroup: Option<&str>, device: Option<&str>) -> ArtifactIndex {
        self.index.filtered(filegroup, device)
    }

    /// 删除整个文件组，或文件组内某台设备的全部版本；返回删除的版本数
    pub async fn remove(&mut self, filegroup: &str, device: Option<&str>) -> EngineResult<usize> {
        validate_name(filegroup)?;
        let removed = match device {
            Some(device) => {
                validate_name(device)?;
                let count = self.index.series(filegroup, device).len();
                remove_dir_if_exists(&self.root.join(filegroup).join(device)).await?;
                if let Some(devices) = self.index.filegroups.get_mut(filegroup) {
                    devices.remove(device);
                }
                count
            }
            None => {
                let count = self.index.filtered(Some(filegroup), None).total_entries();
                remove_dir_if_exists(&self.root.join(filegroup)).await?;
                self.index.filegroups.remove(filegroup);
                count
            }
        };
        self.index.prune();
        self.persist_index().await?;
        info!("删除文件: {} {:?}，共 {} 个版本", filegroup, device, removed);
        Ok(removed)
    }

    /// 比较同一设备的两个版本
    ///
    /// `a` 和 `b` 是新旧位置（1为最新），输出总是从较旧版本到较新版本。
    /// 任一版本不存在时返回 `None`。
    pub async fn diff(
        &self,
        filegroup: &str,
        device: &str,
        a: usize,
        b: usize,
    ) -> EngineResult<Option<String>> {
        let mut found = self
            .read(filegroup, device, &ArtifactSelector::Recent(vec![a, b]))
            .await?;
        if found.len() != 2 {
            return Ok(None);
        }
        found.sort_by_key(|artifact| artifact.generation);
        let (old, new) = (&found[0], &found[1]);
        Ok(Some(line_diff(
            &label(old),
            &label(new),
            &old.content,
            &new.content,
        )))
    }

    /// 将新内容与文件组中该设备的最新版本比较
    pub async fn diff_with_last(
        &self,
        filegroup: &str,
        device: &str,
        content: &str,
    ) -> EngineResult<Option<String>> {
        Ok(self.read_last(filegroup, device).await?.map(|last| {
            line_diff(&label(&last), &format!("{filegroup}/{device}@new"), &last.content, content)
        }))
    }

    async fn persist_index(&self) -> EngineResult<()> {
        let body = serde_json::to_vec_pretty(&self.index)?;
        let path = self.root.join(INDEX_FILE);
        tokio::fs::write(&path, body)
            .await
            .map_err(EngineError::artifact(&path))?;
        Ok(())
    }
}

fn label(artifact: &Artifact) -> String {
    format!(
        "{}/{}@{}",
        artifact.filegroup, artifact.device, artifact.generation
    )
}

fn validate_name(name: &str) -> EngineResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name == INDEX_FILE
    {
        return Err(EngineError::InvalidParameters(format!(
            "无效的文件组或设备名: {name:?}"
        )));
    }
    Ok(())
}

async fn remove_file_if_exists(path: &Path) -> EngineResult<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(EngineError::artifact(path)(e)),
        _ => Ok(()),
    }
}

async fn remove_dir_if_exists(path: &Path) -> EngineResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(EngineError::artifact(path)(e)),
        _ => Ok(()),
    }
}
