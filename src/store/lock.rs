use std::{
   ffi::OsString,
   fs::{self, File, OpenOptions},
   path::{Path, PathBuf},
};

use fs4::FileExt;

use crate::error::StoreError;

/// Advisory lock on the sidecar `<document>.lock` file, held for the
/// duration of one store operation and released on drop.
pub(super) struct DocumentLock {
   file: File,
}

impl DocumentLock {
   fn lock_path(document: &Path) -> PathBuf {
      let mut name = OsString::from(document.as_os_str());
      name.push(".lock");
      PathBuf::from(name)
   }

   fn open(document: &Path) -> Result<File, StoreError> {
      let lock_path = Self::lock_path(document);
      if let Some(parent) = lock_path.parent() {
         fs::create_dir_all(parent).map_err(StoreError::Lock)?;
      }
      OpenOptions::new()
         .create(true)
         .truncate(false)
         .read(true)
         .write(true)
         .open(&lock_path)
         .map_err(StoreError::Lock)
   }

   pub(super) fn acquire_shared(document: &Path) -> Result<Self, StoreError> {
      let file = Self::open(document)?;
      file.lock_shared().map_err(StoreError::Lock)?;
      Ok(Self { file })
   }

   pub(super) fn acquire_exclusive(document: &Path) -> Result<Self, StoreError> {
      let file = Self::open(document)?;
      file.lock_exclusive().map_err(StoreError::Lock)?;
      Ok(Self { file })
   }
}

impl Drop for DocumentLock {
   fn drop(&mut self) {
      let _ = FileExt::unlock(&self.file);
   }
}
