use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::Storage;
use crate::error::Result;
use crate::flock::{DirLock, LOCK_FILE};

const TMP_SUFFIX: &str = ".tmp";

/// Objects stored as files in one directory.
///
/// Holds the directory's single-writer lease until [`Storage::release`] is
/// called or the storage is dropped.
pub struct LocalStorage {
    dir: PathBuf,
    appenders: Mutex<HashMap<String, File>>,
    lock: Mutex<Option<DirLock>>,
}

impl std::fmt::Debug for LocalStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStorage")
            .field("dir", &self.dir)
            .finish()
    }
}

impl LocalStorage {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let lock = DirLock::acquire(&dir)?;

        Ok(Self {
            dir,
            appenders: Mutex::new(HashMap::new()),
            lock: Mutex::new(Some(lock)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn sync_dir(&self) -> Result<()> {
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

impl Storage for LocalStorage {
    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name == LOCK_FILE || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    fn append(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut appenders = self.appenders.lock()?;
        if !appenders.contains_key(name) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path(name))?;
            appenders.insert(name.to_string(), file);
        }
        if let Some(file) = appenders.get_mut(name) {
            file.write_all(bytes)?;
        }
        Ok(())
    }

    fn sync(&self, name: &str) -> Result<()> {
        let appenders = self.appenders.lock()?;
        match appenders.get(name) {
            Some(file) => file.sync_data()?,
            None => File::open(self.path(name))?.sync_data()?,
        }
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.path(name))?)
    }

    fn read_range(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = File::open(self.path(name))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.appenders.lock()?.remove(name);
        let tmp = self.path(&format!("{}{}", name, TMP_SUFFIX));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.path(name))?;
        self.sync_dir()
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.appenders.lock()?.remove(name);
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn release(&self) -> Result<()> {
        let synced = self
            .appenders
            .lock()?
            .drain()
            .try_for_each(|(_, file)| file.sync_data());
        if self.lock.lock()?.take().is_some() {
            tracing::debug!(dir = %self.dir.display(), "Released directory lease");
        }
        Ok(synced?)
    }
}
