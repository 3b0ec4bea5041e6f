use std::collections::BTreeMap;

use object_store::path::Path;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const META_FILENAME: &str = "meta.json";
pub const TOMBSTONES_FILENAME: &str = "tombstones";
pub const MARKERS_PATHNAME: &str = "markers";

const DELETION_MARK_SUFFIX: &str = "-deletion-mark.json";
const NO_COMPACT_MARK_SUFFIX: &str = "-no-compact-mark.json";

/// Reason recorded on no-compaction marks written when a block fails
/// compaction with out-of-order chunks.
pub const OUT_OF_ORDER_CHUNKS_NO_COMPACT_REASON: &str = "block-index-out-of-order-chunk";

const META_VERSION: u32 = 1;

fn default_meta_version() -> u32 {
    META_VERSION
}

/// Metadata describing one immutable block in the bucket, serialized as the
/// block's `meta.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    #[serde(default = "default_meta_version")]
    pub version: u32,
    pub ulid: Ulid,
    /// Inclusive lower bound of the block's time window, ms since epoch.
    pub min_time: i64,
    /// Inclusive upper bound of the block's time window, ms since epoch.
    pub max_time: i64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub downsample: Downsample,
    #[serde(default)]
    pub compaction: BlockCompaction,
    #[serde(default)]
    pub stats: BlockStats,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Downsample {
    pub resolution: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockCompaction {
    /// 1 for freshly ingested blocks; each merge produces max(level) + 1.
    pub level: u32,
    /// Every block ever merged into this block's lineage.
    #[serde(default)]
    pub sources: Vec<Ulid>,
}

impl Default for BlockCompaction {
    fn default() -> Self {
        Self {
            level: 1,
            sources: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    pub num_samples: u64,
}

impl BlockMeta {
    /// The block's source set for dedup purposes; blocks that predate source
    /// tracking count as their own single source.
    pub(crate) fn sources_or_self(&self) -> Vec<Ulid> {
        if self.compaction.sources.is_empty() {
            vec![self.ulid]
        } else {
            self.compaction.sources.clone()
        }
    }
}

/// Smallest `min_time` across `metas`, or `None` for an empty slice.
pub(crate) fn min_time(metas: &[std::sync::Arc<BlockMeta>]) -> Option<i64> {
    metas.iter().map(|m| m.min_time).min()
}

/// Largest `max_time` across `metas`, or `None` for an empty slice.
pub(crate) fn max_time(metas: &[std::sync::Arc<BlockMeta>]) -> Option<i64> {
    metas.iter().map(|m| m.max_time).max()
}

/// Presence object recording that a block has been superseded and may be
/// removed by the retention worker. Once written it is authoritative.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionMark {
    pub id: Ulid,
    /// Unix seconds at which the mark was written.
    pub deletion_time: i64,
    pub details: String,
}

/// Presence object excluding a block from compaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoCompactMark {
    pub id: Ulid,
    /// Unix seconds at which the mark was written.
    pub no_compact_time: i64,
    pub reason: String,
}

pub fn block_prefix(id: Ulid) -> Path {
    Path::from(id.to_string())
}

pub fn meta_path(id: Ulid) -> Path {
    Path::from(format!("{}/{}", id, META_FILENAME))
}

pub fn markers_prefix() -> Path {
    Path::from(MARKERS_PATHNAME)
}

pub fn deletion_mark_path(id: Ulid) -> Path {
    Path::from(format!("{}/{}{}", MARKERS_PATHNAME, id, DELETION_MARK_SUFFIX))
}

pub fn no_compact_mark_path(id: Ulid) -> Path {
    Path::from(format!(
        "{}/{}{}",
        MARKERS_PATHNAME, id, NO_COMPACT_MARK_SUFFIX
    ))
}

/// Parses a top-level bucket directory name into a block id. Non-ULID
/// directories (such as `markers/`) are not blocks.
pub fn parse_block_dir(name: &str) -> Option<Ulid> {
    Ulid::from_string(name).ok()
}

/// Returns the block id when `name` is a deletion mark file basename.
pub fn is_deletion_mark_filename(name: &str) -> Option<Ulid> {
    let id = name.strip_suffix(DELETION_MARK_SUFFIX)?;
    Ulid::from_string(id).ok()
}

/// Returns the block id when `name` is a no-compaction mark file basename.
pub fn is_no_compact_mark_filename(name: &str) -> Option<Ulid> {
    let id = name.strip_suffix(NO_COMPACT_MARK_SUFFIX)?;
    Ulid::from_string(id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ulid() -> Ulid {
        Ulid::from_string("01H8Z0A0A0A0A0A0A0A0A0A0A0").unwrap()
    }

    #[test]
    fn test_meta_json_field_names() {
        let meta = BlockMeta {
            version: 1,
            ulid: test_ulid(),
            min_time: 1000,
            max_time: 2000,
            labels: BTreeMap::from([("__name__".to_string(), "cpu".to_string())]),
            downsample: Downsample { resolution: 0 },
            compaction: BlockCompaction {
                level: 1,
                sources: vec![test_ulid()],
            },
            stats: BlockStats { num_samples: 5 },
        };

        let encoded = serde_json::to_value(&meta).unwrap();
        assert_eq!(encoded["minTime"], 1000);
        assert_eq!(encoded["maxTime"], 2000);
        assert_eq!(encoded["stats"]["numSamples"], 5);
        assert_eq!(encoded["compaction"]["level"], 1);
        assert_eq!(encoded["downsample"]["resolution"], 0);

        let decoded: BlockMeta = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_meta_defaults_for_missing_sections() {
        let decoded: BlockMeta = serde_json::from_str(&format!(
            r#"{{"ulid":"{}","minTime":0,"maxTime":10}}"#,
            test_ulid()
        ))
        .unwrap();

        assert_eq!(decoded.version, META_VERSION);
        assert_eq!(decoded.compaction.level, 1);
        assert!(decoded.compaction.sources.is_empty());
        assert_eq!(decoded.stats.num_samples, 0);
    }

    #[rstest::rstest]
    #[case("meta.json", false, false)]
    #[case("01H8Z0A0A0A0A0A0A0A0A0A0A0-deletion-mark.json", true, false)]
    #[case("01H8Z0A0A0A0A0A0A0A0A0A0A0-no-compact-mark.json", false, true)]
    #[case("not-a-ulid-deletion-mark.json", false, false)]
    #[case("01H8Z0A0A0A0A0A0A0A0A0A0A0-deletion-mark", false, false)]
    fn test_marker_filename_kinds(
        #[case] name: &str,
        #[case] is_deletion: bool,
        #[case] is_no_compact: bool,
    ) {
        assert_eq!(is_deletion_mark_filename(name).is_some(), is_deletion);
        assert_eq!(is_no_compact_mark_filename(name).is_some(), is_no_compact);
    }

    #[test]
    fn test_marker_filename_parsing() {
        let id = test_ulid();

        let path = deletion_mark_path(id);
        let basename = path.filename().unwrap().to_string();
        assert_eq!(is_deletion_mark_filename(&basename), Some(id));
        assert_eq!(is_no_compact_mark_filename(&basename), None);

        let path = no_compact_mark_path(id);
        let basename = path.filename().unwrap().to_string();
        assert_eq!(is_no_compact_mark_filename(&basename), Some(id));
        assert_eq!(is_deletion_mark_filename(&basename), None);

        assert_eq!(is_deletion_mark_filename("garbage-deletion-mark.json"), None);
    }

    #[test]
    fn test_parse_block_dir_rejects_non_ulids() {
        assert_eq!(parse_block_dir(&test_ulid().to_string()), Some(test_ulid()));
        assert_eq!(parse_block_dir(MARKERS_PATHNAME), None);
        assert_eq!(parse_block_dir("not a block"), None);
    }

    #[test]
    fn test_sources_or_self_falls_back_to_own_id() {
        let meta = BlockMeta {
            version: 1,
            ulid: test_ulid(),
            min_time: 0,
            max_time: 1,
            labels: BTreeMap::new(),
            downsample: Downsample::default(),
            compaction: BlockCompaction::default(),
            stats: BlockStats::default(),
        };
        assert_eq!(meta.sources_or_self(), vec![test_ulid()]);
    }
}
