use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{
    engine::Engine, object_store::ObjectStore, state::State, time::Timestamp, Result,
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const STATE_FILENAME: &str = "state.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const DIRECTORY_PREFIX: &str = "ep";

/// Everything needed to continue a run: progress counters, the serialized
/// state attributes and each stateful algorithm's sub-state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: Timestamp,
    pub state: BTreeMap<String, Value>,
    pub algorithms: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn capture(state: &State, engine: &Engine) -> Result<Self> {
        Ok(Self {
            timestamp: state.timestamp,
            state: state.serialize_attributes()?,
            algorithms: engine.algorithm_state_dicts(),
        })
    }

    /// Restores into a state and engine built the same way as the ones the
    /// snapshot was captured from. Nothing is modified if the schema differs
    /// or any state attribute fails to load.
    pub fn restore(self, state: &mut State, engine: &mut Engine) -> Result<()> {
        state.check_serialized_schema(&self.state)?;
        engine.check_algorithm_states(&self.algorithms)?;
        state.restore_attributes(self.timestamp, self.state)?;
        engine.load_algorithm_state_dicts(self.algorithms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: Option<String>,
    pub timestamp: Timestamp,
    pub state: FileRecord,
}

pub struct SaveRequest<'a> {
    pub base_dir: &'a Path,
    pub snapshot: &'a Snapshot,
    pub config_sha256: Option<String>,
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

impl CheckpointDescriptor {
    pub fn name(&self) -> String {
        self.directory
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub snapshot: Snapshot,
}

pub fn directory_name(timestamp: &Timestamp) -> String {
    format!(
        "{DIRECTORY_PREFIX}{:06}-ba{:012}",
        timestamp.epoch, timestamp.batch
    )
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor> {
    fs::create_dir_all(request.base_dir).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create checkpoint directory {}: {err}",
            request.base_dir.display()
        ))
    })?;

    let checkpoint_dir = request
        .base_dir
        .join(directory_name(&request.snapshot.timestamp));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to remove existing checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir(&checkpoint_dir).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create checkpoint directory {}: {err}",
            checkpoint_dir.display()
        ))
    })?;

    let state_path = checkpoint_dir.join(STATE_FILENAME);
    write_json(&state_path, request.snapshot)?;
    let state_record = file_record(&state_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: request.config_sha256,
        timestamp: request.snapshot.timestamp,
        state: state_record,
    };
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;

    prune_checkpoints(request.base_dir, request.max_keep)?;

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

pub fn latest_checkpoint(base_dir: &Path) -> Result<Option<CheckpointDescriptor>> {
    let entries = checkpoint_directories(base_dir)?;
    let Some(path) = entries.into_iter().max() else {
        return Ok(None);
    };
    let manifest = load_manifest(&path)?;
    Ok(Some(CheckpointDescriptor {
        directory: path,
        manifest,
    }))
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let state_path = directory.join(&manifest.state.filename);
    validate_file(&state_path, &manifest.state.sha256)?;
    let snapshot: Snapshot = read_json(&state_path)?;
    if snapshot.timestamp != manifest.timestamp {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint {} has a manifest timestamp that disagrees with its state",
            directory.display()
        )));
    }

    Ok(LoadOutcome { manifest, snapshot })
}

/// Copies a saved checkpoint to `<remote_prefix>/<checkpoint name>/` and
/// verifies the uploaded sizes.
pub fn upload_checkpoint(
    store: &dyn ObjectStore,
    descriptor: &CheckpointDescriptor,
    remote_prefix: &str,
) -> Result<Vec<String>> {
    let remote_dir = join_object_name(remote_prefix, &descriptor.name());
    let mut uploaded = Vec::new();
    for filename in [STATE_FILENAME, MANIFEST_FILENAME] {
        let local = descriptor.directory.join(filename);
        let object_name = join_object_name(&remote_dir, filename);
        store.upload_object(&object_name, &local)?;

        let expected = local
            .metadata()
            .map_err(|err| {
                TrainingError::checkpoint(format!("failed to stat {}: {err}", local.display()))
            })?
            .len();
        let actual = store.get_object_size(&object_name)?;
        if actual != expected {
            return Err(TrainingError::checkpoint(format!(
                "uploaded {} has {actual} bytes, expected {expected}",
                store.get_uri(&object_name)
            )));
        }
        uploaded.push(store.get_uri(&object_name));
    }
    info!(
        checkpoint = %descriptor.name(),
        remote = %store.get_uri(&remote_dir),
        "checkpoint uploaded"
    );
    Ok(uploaded)
}

/// Downloads `<remote_prefix>/<name>/` into `<base_dir>/<name>/` and returns
/// the local descriptor. Existing local files are replaced.
pub fn fetch_checkpoint(
    store: &dyn ObjectStore,
    remote_prefix: &str,
    name: &str,
    base_dir: &Path,
) -> Result<CheckpointDescriptor> {
    let remote_dir = join_object_name(remote_prefix, name);
    let objects = store.list_objects(Some(&remote_dir))?;
    if objects.is_empty() {
        return Err(TrainingError::checkpoint(format!(
            "no checkpoint files under {}",
            store.get_uri(&remote_dir)
        )));
    }

    let directory = base_dir.join(name);
    for object in objects {
        let Some(filename) = object.rsplit('/').next() else {
            continue;
        };
        store.download_object(&object, &directory.join(filename), true)?;
    }

    let manifest = load_manifest(&directory)?;
    Ok(CheckpointDescriptor {
        directory,
        manifest,
    })
}

fn join_object_name(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn checkpoint_directories(base: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })? {
        let entry = entry.map_err(|err| {
            TrainingError::checkpoint(format!("failed to read checkpoint entry: {err}"))
        })?;
        let file_type = entry.file_type().map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to inspect checkpoint entry {}: {err}",
                entry.path().display()
            ))
        })?;
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(DIRECTORY_PREFIX) && entry.path().join(MANIFEST_FILENAME).is_file() {
            dirs.push(entry.path());
        } else if name.starts_with(DIRECTORY_PREFIX) {
            warn!(path = %entry.path().display(), "skipping checkpoint directory without manifest");
        }
    }
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<()> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::checkpoint(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n").map_err(|err| {
        TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn prune_checkpoints(base: &Path, max_keep: Option<usize>) -> Result<()> {
    let Some(limit) = max_keep else {
        return Ok(());
    };
    if limit == 0 {
        return Ok(());
    }
    let mut dirs = checkpoint_directories(base)?;
    dirs.sort();
    while dirs.len() > limit {
        let victim = dirs.remove(0);
        fs::remove_dir_all(&victim).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::VolumeObjectStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn snapshot(epoch: u64, batch: u64) -> Snapshot {
        let mut state = BTreeMap::new();
        state.insert("seed".to_string(), json!(3));
        let mut algorithms = BTreeMap::new();
        algorithms.insert("early_stopping".to_string(), json!({"best": 0.25}));
        Snapshot {
            timestamp: Timestamp {
                epoch,
                batch,
                batch_in_epoch: batch % 10,
                sample: batch * 4,
                token: batch * 4,
            },
            state,
            algorithms,
        }
    }

    fn save(base: &Path, snap: &Snapshot, max_keep: Option<usize>) -> CheckpointDescriptor {
        save_checkpoint(SaveRequest {
            base_dir: base,
            snapshot: snap,
            config_sha256: Some("abc".into()),
            max_keep,
        })
        .unwrap()
    }

    #[test]
    fn save_then_load_is_exact() {
        let dir = tempdir().unwrap();
        let snap = snapshot(0, 7);
        let descriptor = save(dir.path(), &snap, None);
        assert_eq!(descriptor.name(), "ep000000-ba000000000007");

        let outcome = load_checkpoint(&descriptor.directory).unwrap();
        assert_eq!(outcome.snapshot, snap);
        assert_eq!(outcome.manifest.config_sha256.as_deref(), Some("abc"));
    }

    #[test]
    fn tampered_state_fails_checksum() {
        let dir = tempdir().unwrap();
        let descriptor = save(dir.path(), &snapshot(0, 3), None);
        let state_path = descriptor.directory.join(STATE_FILENAME);
        let mut contents = fs::read_to_string(&state_path).unwrap();
        contents.push(' ');
        fs::write(&state_path, contents).unwrap();

        let err = load_checkpoint(&descriptor.directory).err().unwrap();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn latest_and_pruning_follow_progress() {
        let dir = tempdir().unwrap();
        for batch in [5, 10, 15] {
            save(dir.path(), &snapshot(batch / 10, batch), Some(2));
        }
        let remaining = checkpoint_directories(dir.path()).unwrap();
        assert_eq!(remaining.len(), 2);

        let latest = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(latest.manifest.timestamp.batch, 15);
        assert!(latest_checkpoint(&dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn upload_and_fetch_through_volume_store() {
        let local = tempdir().unwrap();
        let mount = tempdir().unwrap();
        let restored = tempdir().unwrap();
        let store = VolumeObjectStore::new(mount.path(), "Volumes/ml/runs/ckpt").unwrap();

        let snap = snapshot(1, 12);
        let descriptor = save(local.path(), &snap, None);
        let uris = upload_checkpoint(&store, &descriptor, "run-a").unwrap();
        assert_eq!(uris.len(), 2);
        assert!(uris[0].starts_with("dbfs:/Volumes/ml/runs/ckpt/run-a/ep000001"));

        let fetched =
            fetch_checkpoint(&store, "run-a", &descriptor.name(), restored.path()).unwrap();
        let outcome = load_checkpoint(&fetched.directory).unwrap();
        assert_eq!(outcome.snapshot, snap);
    }
}
