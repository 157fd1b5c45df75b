//! Remote storage for checkpoint artifacts.
//!
//! `VolumeObjectStore` targets catalog volumes exposed through a local mount,
//! addressed as `Volumes/<catalog>/<schema>/<volume>/<path>`.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;

const URI_SCHEME: &str = "dbfs";
const VOLUMES_ROOT: &str = "Volumes";
const PREFIX_COMPONENTS: usize = 4;
const COPY_CHUNK_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object {uri} not found")]
    NotFound { uri: String },

    #[error("the file at {} already exists and overwrite is set to false", .path.display())]
    AlreadyExists { path: PathBuf },

    #[error("invalid volume path: {0}")]
    InvalidPath(String),

    /// Failure talking to the store that may succeed on retry.
    #[error("transient object store failure for {uri}: {source}")]
    Transient {
        uri: String,
        #[source]
        source: io::Error,
    },

    #[error("local i/o failure: {0}")]
    Io(#[from] io::Error),
}

pub trait ObjectStore: Send {
    /// URI for `object_name`. Computed statically; the object need not exist.
    fn get_uri(&self, object_name: &str) -> String;

    fn upload_object(&self, object_name: &str, filename: &Path) -> Result<(), ObjectStoreError>;

    fn download_object(
        &self,
        object_name: &str,
        filename: &Path,
        overwrite: bool,
    ) -> Result<(), ObjectStoreError>;

    fn get_object_size(&self, object_name: &str) -> Result<u64, ObjectStoreError>;

    /// Files (never directories) under `prefix`, or under the store root when
    /// `prefix` is `None` or empty.
    fn list_objects(&self, prefix: Option<&str>) -> Result<Vec<String>, ObjectStoreError>;
}

#[derive(Debug, Clone)]
pub struct VolumeObjectStore {
    mount_root: PathBuf,
    prefix: String,
}

impl VolumeObjectStore {
    /// `mount_root` is the local directory the `Volumes` tree is mounted under.
    pub fn new(mount_root: impl Into<PathBuf>, path: &str) -> Result<Self, ObjectStoreError> {
        let prefix = validate_volume_path(path)?;
        Ok(Self {
            mount_root: mount_root.into(),
            prefix,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Store path (`/Volumes/...`) of `object_name`. Names that already start
    /// with the volume prefix are made relative to it first.
    pub fn object_path(&self, object_name: &str) -> String {
        let components = normalize(object_name);
        let prefix_components: Vec<&str> = self.prefix.split('/').collect();
        let relative = if components.len() >= prefix_components.len()
            && components[..prefix_components.len()] == prefix_components[..]
        {
            &components[prefix_components.len()..]
        } else {
            &components[..]
        };
        if relative.is_empty() {
            format!("/{}", self.prefix)
        } else {
            format!("/{}/{}", self.prefix, relative.join("/"))
        }
    }

    fn local_path(&self, object_name: &str) -> PathBuf {
        let store_path = self.object_path(object_name);
        self.mount_root.join(store_path.trim_start_matches('/'))
    }

    fn wrap_error(&self, object_name: &str, err: io::Error) -> ObjectStoreError {
        let uri = self.get_uri(object_name);
        if err.kind() == io::ErrorKind::NotFound {
            ObjectStoreError::NotFound { uri }
        } else {
            ObjectStoreError::Transient { uri, source: err }
        }
    }
}

impl ObjectStore for VolumeObjectStore {
    fn get_uri(&self, object_name: &str) -> String {
        format!("{URI_SCHEME}:{}", self.object_path(object_name))
    }

    fn upload_object(&self, object_name: &str, filename: &Path) -> Result<(), ObjectStoreError> {
        let target = self.local_path(object_name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| self.wrap_error(object_name, err))?;
        }
        let mut source = File::open(filename)?;
        let mut sink = File::create(&target).map_err(|err| self.wrap_error(object_name, err))?;
        copy_chunked(&mut source, &mut sink).map_err(|err| self.wrap_error(object_name, err))?;
        debug!(uri = %self.get_uri(object_name), "uploaded object");
        Ok(())
    }

    fn download_object(
        &self,
        object_name: &str,
        filename: &Path,
        overwrite: bool,
    ) -> Result<(), ObjectStoreError> {
        if filename.exists() && !overwrite {
            return Err(ObjectStoreError::AlreadyExists {
                path: filename.to_path_buf(),
            });
        }
        if let Some(parent) = filename.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp_name = filename.as_os_str().to_owned();
        tmp_name.push(format!("{:016x}.tmp", rand::random::<u64>()));
        let tmp_path = PathBuf::from(tmp_name);

        let fetched = (|| {
            let mut source = File::open(self.local_path(object_name))
                .map_err(|err| self.wrap_error(object_name, err))?;
            let mut sink = File::create(&tmp_path)?;
            copy_chunked(&mut source, &mut sink)
                .map_err(|err| self.wrap_error(object_name, err))?;
            sink.flush()?;
            Ok::<(), ObjectStoreError>(())
        })();

        if let Err(err) = fetched {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if !overwrite && filename.exists() {
            let _ = fs::remove_file(&tmp_path);
            return Err(ObjectStoreError::AlreadyExists {
                path: filename.to_path_buf(),
            });
        }
        fs::rename(&tmp_path, filename)?;
        debug!(uri = %self.get_uri(object_name), path = %filename.display(), "downloaded object");
        Ok(())
    }

    fn get_object_size(&self, object_name: &str) -> Result<u64, ObjectStoreError> {
        let metadata = fs::metadata(self.local_path(object_name))
            .map_err(|err| self.wrap_error(object_name, err))?;
        if metadata.is_dir() {
            return Err(ObjectStoreError::NotFound {
                uri: self.get_uri(object_name),
            });
        }
        Ok(metadata.len())
    }

    fn list_objects(&self, prefix: Option<&str>) -> Result<Vec<String>, ObjectStoreError> {
        let prefix = match prefix {
            Some(p) if !p.is_empty() => p,
            _ => self.prefix.as_str(),
        };
        let directory = self.local_path(prefix);
        let entries = fs::read_dir(&directory).map_err(|err| self.wrap_error(prefix, err))?;

        let base = self.object_path(prefix);
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| self.wrap_error(prefix, err))?;
            let file_type = entry
                .file_type()
                .map_err(|err| self.wrap_error(prefix, err))?;
            if file_type.is_dir() {
                continue;
            }
            files.push(format!("{base}/{}", entry.file_name().to_string_lossy()));
        }
        files.sort();
        Ok(files)
    }
}

/// Returns the `Volumes/<catalog>/<schema>/<volume>` prefix of `path`.
///
/// Only the first four components are kept; anything deeper is ignored.
pub fn validate_volume_path(path: &str) -> Result<String, ObjectStoreError> {
    let components = normalize(path);
    if path.starts_with('/') || components.first().copied() != Some(VOLUMES_ROOT) {
        return Err(ObjectStoreError::InvalidPath(format!(
            "volume paths should start with \"{VOLUMES_ROOT}\" (got {path})"
        )));
    }
    if components.len() < PREFIX_COMPONENTS {
        return Err(ObjectStoreError::InvalidPath(format!(
            "expected `{VOLUMES_ROOT}/<catalog-name>/<schema-name>/<volume-name>/<optional-path>`, found {path}"
        )));
    }
    Ok(components[..PREFIX_COMPONENTS].join("/"))
}

fn normalize(path: &str) -> Vec<&str> {
    let mut components: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            other => components.push(other),
        }
    }
    components
}

fn copy_chunked(source: &mut impl Read, sink: &mut impl Write) -> io::Result<()> {
    let mut buffer = vec![0u8; COPY_CHUNK_BYTES];
    loop {
        let read = source.read(&mut buffer)?;
        if read == 0 {
            return Ok(());
        }
        sink.write_all(&buffer[..read])?;
    }
}
