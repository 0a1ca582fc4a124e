//! Where finished files end up.
//!
//! A batch job writes its output to a scratch file first; once the file is
//! complete an [`OutputPlacement`] moves it to its final location under a
//! logical file name.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CompressError, CompressResult};

/// Moves a finished file to its final location.
pub trait OutputPlacement: Send + Sync {
    /// Move `temp_file` into place as `logical_name` and return where it
    /// landed.
    fn materialize(&self, temp_file: &Path, logical_name: &str) -> CompressResult<PathBuf>;
}

/// File name for an output called `name`.
///
/// A streamable job writes an intermediate file first, which carries a
/// `_temp` suffix. `.mp4` is appended when the name has no such extension.
pub fn validated_file_name(name: &str, streamable: bool) -> String {
    let has_extension = Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"));
    let stem = if has_extension {
        &name[..name.len() - 4]
    } else {
        name
    };
    if streamable {
        format!("{stem}_temp.mp4")
    } else {
        format!("{stem}.mp4")
    }
}

/// Rename `from` to `to`, copying when they are on different filesystems.
fn move_file(from: &Path, to: &Path) -> CompressResult<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| placement_error(parent, e))?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| placement_error(to, e))?;
    fs::remove_file(from).map_err(|e| placement_error(from, e))?;
    debug!(from = %from.display(), to = %to.display(), "Copied output across filesystems");
    Ok(())
}

fn placement_error(path: &Path, e: io::Error) -> CompressError {
    CompressError::Placement(format!("{}: {e}", path.display()))
}

fn join_sub_folder(dir: &Path, sub_folder: Option<&str>) -> PathBuf {
    match sub_folder {
        Some(sub) => dir.join(sub),
        None => dir.to_path_buf(),
    }
}

/// Private application directory, optionally under a sub folder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSpecificStorage {
    pub dir: PathBuf,
    pub sub_folder: Option<String>,
}

impl OutputPlacement for AppSpecificStorage {
    fn materialize(&self, temp_file: &Path, logical_name: &str) -> CompressResult<PathBuf> {
        let target = join_sub_folder(&self.dir, self.sub_folder.as_deref()).join(logical_name);
        move_file(temp_file, &target)?;
        info!(path = %target.display(), "Saved to app storage");
        Ok(target)
    }
}

/// Well-known shared media folders.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveLocation {
    Pictures,
    Downloads,
    #[default]
    Movies,
}

impl SaveLocation {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Pictures => "Pictures",
            Self::Downloads => "Downloads",
            Self::Movies => "Movies",
        }
    }
}

/// A shared media folder below `root`, e.g. `<root>/Movies/<sub_folder>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedStorage {
    pub root: PathBuf,
    pub location: SaveLocation,
    pub sub_folder: Option<String>,
}

impl OutputPlacement for SharedStorage {
    fn materialize(&self, temp_file: &Path, logical_name: &str) -> CompressResult<PathBuf> {
        let dir = self.root.join(self.location.dir_name());
        let target = join_sub_folder(&dir, self.sub_folder.as_deref()).join(logical_name);
        move_file(temp_file, &target)?;
        info!(path = %target.display(), location = ?self.location, "Saved to shared storage");
        Ok(target)
    }
}

/// A cache directory. Existing files are never overwritten; a numeric
/// suffix is added instead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStorage {
    pub dir: PathBuf,
}

impl CacheStorage {
    fn free_path(&self, logical_name: &str) -> PathBuf {
        let candidate = self.dir.join(logical_name);
        if !candidate.exists() {
            return candidate;
        }
        let name = Path::new(logical_name);
        let stem = name
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = name
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        (1u32..)
            .map(|n| self.dir.join(format!("{stem}-{n}{ext}")))
            .find(|path| !path.exists())
            .unwrap_or(candidate)
    }
}

impl OutputPlacement for CacheStorage {
    fn materialize(&self, temp_file: &Path, logical_name: &str) -> CompressResult<PathBuf> {
        let target = self.free_path(logical_name);
        move_file(temp_file, &target)?;
        info!(path = %target.display(), "Saved to cache");
        Ok(target)
    }
}

/// Leaves the file where the job wrote it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KeepInPlace;

impl OutputPlacement for KeepInPlace {
    fn materialize(&self, temp_file: &Path, _logical_name: &str) -> CompressResult<PathBuf> {
        Ok(temp_file.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sq_engine_storage_{}_{name}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn scratch_file(dir: &Path, contents: &[u8]) -> PathBuf {
        let path = dir.join("scratch.bin");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn file_names() {
        assert_eq!(validated_file_name("holiday", false), "holiday.mp4");
        assert_eq!(validated_file_name("holiday.mp4", false), "holiday.mp4");
        assert_eq!(validated_file_name("holiday.MP4", false), "holiday.mp4");
        assert_eq!(validated_file_name("holiday", true), "holiday_temp.mp4");
        assert_eq!(validated_file_name("clip.mov", false), "clip.mov.mp4");
    }

    #[test]
    fn app_storage_uses_sub_folder() {
        let dir = temp_dir("app");
        let placement = AppSpecificStorage {
            dir: dir.clone(),
            sub_folder: Some("compressed".into()),
        };
        let scratch = scratch_file(&dir, b"movie");
        let path = placement.materialize(&scratch, "out.mp4").unwrap();
        assert_eq!(path, dir.join("compressed").join("out.mp4"));
        assert_eq!(fs::read(&path).unwrap(), b"movie");
        assert!(!scratch.exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn shared_storage_picks_media_folder() {
        let dir = temp_dir("shared");
        let placement = SharedStorage {
            root: dir.clone(),
            location: SaveLocation::Downloads,
            sub_folder: None,
        };
        let scratch = scratch_file(&dir, b"movie");
        let path = placement.materialize(&scratch, "out.mp4").unwrap();
        assert_eq!(path, dir.join("Downloads").join("out.mp4"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cache_storage_never_overwrites() {
        let dir = temp_dir("cache");
        fs::write(dir.join("out.mp4"), b"old").unwrap();
        let placement = CacheStorage { dir: dir.clone() };
        let scratch = scratch_file(&dir, b"new");
        let path = placement.materialize(&scratch, "out.mp4").unwrap();
        assert_eq!(path, dir.join("out-1.mp4"));
        assert_eq!(fs::read(dir.join("out.mp4")).unwrap(), b"old");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn keep_in_place_is_identity() {
        let path = Path::new("/tmp/whatever.mp4");
        assert_eq!(KeepInPlace.materialize(path, "ignored").unwrap(), path);
    }
}
