use std::fs::{DirBuilder, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use tempfile::NamedTempFile;

/// A compiled program waiting to be executed
///
/// Lives in a private (`0700`) directory on the host, outside any workspace.
/// The file is deleted when the artifact is dropped.
#[derive(Debug)]
pub struct Artifact {
    file: NamedTempFile,
    len: u64,
}

impl Artifact {
    pub(crate) async fn store(dir: &Path, bytes: Vec<u8>) -> io::Result<Self> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || Self::store_blocking(&dir, &bytes))
            .await
            .map_err(io::Error::other)?
    }

    fn store_blocking(dir: &Path, bytes: &[u8]) -> io::Result<Self> {
        DirBuilder::new().recursive(true).mode(0o700).create(dir)?;

        let mut file = tempfile::Builder::new()
            .prefix("kiln-")
            .permissions(Permissions::from_mode(0o700))
            .tempfile_in(dir)?;
        file.write_all(bytes)?;
        file.flush()?;

        Ok(Self {
            file,
            len: bytes.len() as u64,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn read(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.path()).await
    }
}
