use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::Format;
use figment::Figment;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, SettingsError};

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    duration_str::parse(s.as_str()).map_err(D::Error::custom)
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}ms", duration.as_millis()))
}

/// Options for the bucket compactor.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CompactorOptions {
    /// Number of jobs compacted concurrently within one pass.
    pub concurrency: usize,

    /// Fanout for block downloads and uploads within a single job.
    pub block_sync_concurrency: usize,

    /// Fanout for opening block readers within a single job.
    pub block_open_concurrency: usize,

    /// Local scratch directory. Each job works in an exclusive subdirectory;
    /// the whole tree is removed when a compaction run finishes cleanly.
    pub compact_dir: PathBuf,

    /// Minimum age of every block in a job before the job becomes eligible,
    /// to avoid compacting blocks that are still racing with writers. Zero
    /// admits all jobs.
    #[serde(deserialize_with = "deserialize_duration")]
    #[serde(serialize_with = "serialize_duration")]
    pub wait_period: Duration,

    /// Wall-clock bound for one `compact` call. After this much time no new
    /// jobs are started; in-flight jobs are allowed to finish. Zero means
    /// unlimited.
    #[serde(deserialize_with = "deserialize_duration")]
    #[serde(serialize_with = "serialize_duration")]
    pub max_compaction_time: Duration,
}

impl Default for CompactorOptions {
    /// Returns a `CompactorOptions` with a single job worker, an 8-way
    /// download/upload and open fanout, no wait period, and no time bound.
    fn default() -> Self {
        Self {
            concurrency: 1,
            block_sync_concurrency: 8,
            block_open_concurrency: 8,
            compact_dir: PathBuf::from("./data/compact"),
            wait_period: Duration::ZERO,
            max_compaction_time: Duration::ZERO,
        }
    }
}

impl CompactorOptions {
    /// Loads options from a configuration file. The format is determined by
    /// the file extension: ".json", ".toml", ".yaml" or ".yml".
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let figment = match ext {
            "json" => Figment::new().merge(figment::providers::Json::file(path)),
            "toml" => Figment::new().merge(figment::providers::Toml::file(path)),
            "yaml" | "yml" => Figment::new().merge(figment::providers::Yaml::file(path)),
            _ => return Err(SettingsError::UnknownFormat(path.to_path_buf())),
        };
        figment.extract().map_err(|e| Box::new(e).into())
    }

    /// Rejects option combinations the compactor cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.concurrency == 0 {
            return Err(Error::InvalidConcurrency(self.concurrency));
        }
        if self.block_sync_concurrency == 0 {
            return Err(Error::InvalidConcurrency(self.block_sync_concurrency));
        }
        if self.block_open_concurrency == 0 {
            return Err(Error::InvalidConcurrency(self.block_open_concurrency));
        }
        Ok(())
    }
}
