use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fleetd_core::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub(crate) const INDEX_FILE: &str = "index.json";
pub(crate) const ARTIFACT_EXTENSION: &str = "txt";

/// 单个版本的索引条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub generation: u64,
    /// 相对于存储根目录的路径
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
}

/// 文件组索引：文件组 -> 设备 -> 按版本号升序排列的条目
///
/// 目录内容是唯一可信来源，索引只是缓存，可以随时从目录树重建。
/// `high_water` 记录每个 (文件组, 设备) 分配过的最大版本号，删除后版本号
/// 不会重复使用。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub filegroups: BTreeMap<String, BTreeMap<String, Vec<ArtifactEntry>>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) high_water: BTreeMap<String, BTreeMap<String, u64>>,
}

impl ArtifactIndex {
    pub fn series(&self, filegroup: &str, device: &str) -> &[ArtifactEntry] {
        self.filegroups
            .get(filegroup)
            .and_then(|devices| devices.get(device))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn series_mut(&mut self, filegroup: &str, device: &str) -> &mut Vec<ArtifactEntry> {
        self.filegroups
            .entry(filegroup.to_string())
            .or_default()
            .entry(device.to_string())
            .or_default()
    }

    fn high_water_mark(&self, filegroup: &str, device: &str) -> u64 {
        self.high_water
            .get(filegroup)
            .and_then(|devices| devices.get(device))
            .copied()
            .unwrap_or(0)
    }

    pub fn next_generation(&self, filegroup: &str, device: &str) -> u64 {
        let last = self
            .series(filegroup, device)
            .last()
            .map_or(0, |entry| entry.generation);
        last.max(self.high_water_mark(filegroup, device)) + 1
    }

    pub(crate) fn record_generation(&mut self, filegroup: &str, device: &str, generation: u64) {
        let mark = self
            .high_water
            .entry(filegroup.to_string())
            .or_default()
            .entry(device.to_string())
            .or_default();
        *mark = (*mark).max(generation);
    }

    /// 合并旧索引中的版本号上限，目录树中仍存在的版本同样计入
    pub(crate) fn restore_high_water(&mut self, previous: &ArtifactIndex) {
        let mut marks: Vec<(String, String, u64)> = Vec::new();
        for (filegroup, devices) in previous.high_water.iter() {
            for (device, generation) in devices {
                marks.push((filegroup.clone(), device.clone(), *generation));
            }
        }
        for index in [previous, &*self] {
            for (filegroup, devices) in &index.filegroups {
                for (device, entries) in devices {
                    if let Some(last) = entries.last() {
                        marks.push((filegroup.clone(), device.clone(), last.generation));
                    }
                }
            }
        }
        for (filegroup, device, generation) in marks {
            self.record_generation(&filegroup, &device, generation);
        }
    }

    /// 按文件组和设备筛选出的子索引
    pub fn filtered(&self, filegroup: Option<&str>, device: Option<&str>) -> ArtifactIndex {
        let filegroups = self
            .filegroups
            .iter()
            .filter(|(name, _)| filegroup.map_or(true, |fg| fg == name.as_str()))
            .filter_map(|(name, devices)| {
                let devices: BTreeMap<_, _> = devices
                    .iter()
                    .filter(|(dev, _)| device.map_or(true, |d| d == dev.as_str()))
                    .map(|(dev, entries)| (dev.clone(), entries.clone()))
                    .collect();
                (!devices.is_empty()).then(|| (name.clone(), devices))
            })
            .collect();
        ArtifactIndex {
            filegroups,
            high_water: BTreeMap::new(),
        }
    }

    pub fn total_entries(&self) -> usize {
        self.filegroups
            .values()
            .flat_map(BTreeMap::values)
            .map(Vec::len)
            .sum()
    }

    /// 删除空的设备和文件组
    pub(crate) fn prune(&mut self) {
        for devices in self.filegroups.values_mut() {
            devices.retain(|_, entries| !entries.is_empty());
        }
        self.filegroups.retain(|_, devices| !devices.is_empty());
    }

    /// 读取上次保存的索引文件，不存在或无法解析时返回 `None`
    pub(crate) async fn load(root: &Path) -> Option<Self> {
        let path = root.join(INDEX_FILE);
        let body = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&body) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!("索引文件 {} 无法解析，将从目录树重建: {}", path.display(), e);
                None
            }
        }
    }

    /// 扫描目录树重建索引
    pub async fn rebuild(root: &Path) -> EngineResult<Self> {
        let mut index = ArtifactIndex::default();
        if !tokio::fs::try_exists(root)
            .await
            .map_err(EngineError::artifact(root))?
        {
            return Ok(index);
        }

        let mut groups = tokio::fs::read_dir(root)
            .await
            .map_err(EngineError::artifact(root))?;
        while let Some(group) = groups
            .next_entry()
            .await
            .map_err(EngineError::artifact(root))?
        {
            let group_path = group.path();
            if !group
                .file_type()
                .await
                .map_err(EngineError::artifact(&group_path))?
                .is_dir()
            {
                continue;
            }
            let filegroup = group.file_name().to_string_lossy().into_owned();

            let mut devices = tokio::fs::read_dir(&group_path)
                .await
                .map_err(EngineError::artifact(&group_path))?;
            while let Some(device) = devices
                .next_entry()
                .await
                .map_err(EngineError::artifact(&group_path))?
            {
                let device_path = device.path();
                if !device
                    .file_type()
                    .await
                    .map_err(EngineError::artifact(&device_path))?
                    .is_dir()
                {
                    continue;
                }
                let device_name = device.file_name().to_string_lossy().into_owned();

                let mut files = tokio::fs::read_dir(&device_path)
                    .await
                    .map_err(EngineError::artifact(&device_path))?;
                while let Some(file) = files
                    .next_entry()
                    .await
                    .map_err(EngineError::artifact(&device_path))?
                {
                    let path = file.path();
                    let Some(generation) = parse_generation(&path) else {
                        warn!("忽略无法识别的文件: {}", path.display());
                        continue;
                    };
                    let metadata = file.metadata().await.map_err(EngineError::artifact(&path))?;
                    let timestamp = metadata
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now());
                    index.series_mut(&filegroup, &device_name).push(ArtifactEntry {
                        generation,
                        path: relative_path(&filegroup, &device_name, generation),
                        timestamp,
                        size: metadata.len(),
                    });
                }
            }
        }

        for devices in index.filegroups.values_mut() {
            for entries in devices.values_mut() {
                entries.sort_by_key(|entry| entry.generation);
            }
        }
        index.prune();
        debug!("从目录树重建索引: {} 个版本", index.total_entries());
        Ok(index)
    }
}

pub(crate) fn relative_path(filegroup: &str, device: &str, generation: u64) -> PathBuf {
    PathBuf::from(filegroup)
        .join(device)
        .join(format!("{generation:08}.{ARTIFACT_EXTENSION}"))
}

fn parse_generation(path: &Path) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}
