use std::fs::{self, read_dir, remove_dir, remove_file};
use std::io::{self, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::{CacheBackend, CacheContents, CacheEntry, CacheError, CacheKey};

/// The on-disk format of one cache entry.
#[derive(Serialize, Deserialize)]
struct FsRecord<V> {
    key: String,
    inserted_at: DateTime<Utc>,
    value: V,
}

/// Only the header of a [`FsRecord`], used to inspect entries without decoding their value.
#[derive(Deserialize)]
struct FsHeader {
    inserted_at: DateTime<Utc>,
}

/// A [`CacheBackend`] that stores every entry as a JSON file.
///
/// Entries live at `<cache_dir>/<cache_path of key>`. Writes go to a temporary file inside
/// `tmp_dir` first, which is then atomically moved into place, so readers never observe a
/// partially written entry.
pub struct FsBackend<T> {
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
    _value: PhantomData<fn() -> T>,
}

impl<T> FsBackend<T> {
    /// Creates the backend, creating both directories if they do not exist.
    pub fn new(cache_dir: PathBuf, tmp_dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&cache_dir)?;
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self {
            cache_dir,
            tmp_dir,
            _value: PhantomData,
        })
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.cache_path())
    }

    /// Removes expired files below `directory`, returning `true` if the directory is left empty.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        cutoff: DateTime<Utc>,
        removed: &mut usize,
    ) -> io::Result<bool> {
        let Some(entries) = catch_not_found(|| read_dir(directory))? else {
            return Ok(true);
        };

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty = self.cleanup_directory_recursive(&path, cutoff, removed)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if let Err(e) = remove_dir(&path) {
                        // Another writer may have created an entry in the meantime.
                        tracing::debug!("Failed to remove cache directory: {:?}", e);
                        dir_is_empty = false;
                    }
                }
                is_empty &= dir_is_empty;
            } else {
                match try_cleanup_path(&path, cutoff) {
                    Ok(Some(true)) => *removed += 1,
                    Ok(Some(false)) => is_empty = false,
                    Ok(None) => {}
                    Err(e) => {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.display().to_string().into()),
                            || tracing::error!("Failed to clean cache file: {:?}", e),
                        );
                        is_empty = false;
                    }
                }
            }
        }

        Ok(is_empty)
    }

    fn collect_insertion_times(
        directory: &Path,
        times: &mut Vec<DateTime<Utc>>,
    ) -> io::Result<()> {
        let Some(entries) = catch_not_found(|| read_dir(directory))? else {
            return Ok(());
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_insertion_times(&path, times)?;
            } else if let Some(header) = catch_not_found(|| read_header(&path))? {
                match header {
                    Ok(header) => times.push(header.inserted_at),
                    Err(e) => tracing::warn!("Skipping malformed cache file `{}`: {}", path.display(), e),
                }
            }
        }
        Ok(())
    }
}

impl<T> CacheBackend<T> for FsBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn get(&self, key: &CacheKey) -> CacheContents<Option<CacheEntry<T>>> {
        let path = self.entry_path(key);
        let Some(bytes) = catch_not_found(|| fs::read(&path))? else {
            return Ok(None);
        };
        let record: FsRecord<T> = serde_json::from_slice(&bytes).map_err(|e| {
            tracing::warn!(%key, "Malformed cache file `{}`: {}", path.display(), e);
            CacheError::from(e)
        })?;
        Ok(Some(CacheEntry::with_inserted_at(
            key.clone(),
            record.value.into(),
            record.inserted_at,
        )))
    }

    fn insert(&self, entry: CacheEntry<T>) -> CacheContents {
        let record = FsRecord {
            key: entry.key().to_string(),
            inserted_at: entry.inserted_at(),
            value: &**entry.value(),
        };

        let mut temp_file = NamedTempFile::new_in(&self.tmp_dir)?;
        {
            let mut writer = BufWriter::new(temp_file.as_file_mut());
            serde_json::to_writer(&mut writer, &record)?;
            writer.flush()?;
        }
        persist_tempfile(temp_file, &self.entry_path(entry.key()))?;
        Ok(())
    }

    fn invalidate(&self, key: &CacheKey) -> CacheContents<bool> {
        let removed = catch_not_found(|| remove_file(self.entry_path(key)))?;
        Ok(removed.is_some())
    }

    fn remove_inserted_before(&self, cutoff: DateTime<Utc>) -> CacheContents<usize> {
        let mut removed = 0;
        self.cleanup_directory_recursive(&self.cache_dir, cutoff, &mut removed)?;
        Ok(removed)
    }

    fn insertion_times(&self) -> CacheContents<Vec<DateTime<Utc>>> {
        let mut times = Vec::new();
        Self::collect_insertion_times(&self.cache_dir, &mut times)?;
        Ok(times)
    }
}

fn read_header(path: &Path) -> io::Result<Result<FsHeader, serde_json::Error>> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes))
}

/// Removes the file at `path` if it was inserted before `cutoff`.
///
/// Returns `Some(true)` if an entry was removed, `Some(false)` if it was retained and `None` if
/// the file vanished or was malformed and got removed.
fn try_cleanup_path(path: &Path, cutoff: DateTime<Utc>) -> io::Result<Option<bool>> {
    tracing::trace!("Checking file `{}`", path.display());
    let Some(header) = catch_not_found(|| read_header(path))? else {
        return Ok(None);
    };
    match header {
        Ok(header) if header.inserted_at >= cutoff => Ok(Some(false)),
        Ok(_) => {
            tracing::debug!("Removing file `{}`", path.display());
            Ok(catch_not_found(|| remove_file(path))?.map(|_| true))
        }
        Err(e) => {
            tracing::warn!("Removing malformed cache file `{}`: {}", path.display(), e);
            catch_not_found(|| remove_file(path))?;
            Ok(None)
        }
    }
}

/// Moves a fully written temporary file to its final location.
///
/// The cleanup could concurrently remove the parent directories, so creating them and
/// persisting is retried.
fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<()> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
