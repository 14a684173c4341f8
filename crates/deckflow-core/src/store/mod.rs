pub mod decks;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use fs2::FileExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;

pub use decks::{BackgroundSettings, DeckSettings, ScreensaverSettings};

pub(crate) fn pretty_json_enabled() -> bool {
    // Any truthy value enables it: "1", "true", "yes", "on".
    let v = std::env::var("DECKFLOW_PRETTY_JSON").unwrap_or_default();
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub(crate) fn json_value_to_bytes(value: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error> {
    if pretty_json_enabled() {
        serde_json::to_vec_pretty(value)
    } else {
        serde_json::to_vec(value)
    }
}

/// Replace `path` with `contents` through a locked temp file, keeping a backup until the rename
/// has succeeded.
pub(crate) fn write_atomic_bytes(path: &Path, contents: &[u8]) -> Result<(), anyhow::Error> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("store path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)?;

    let temp_path = path.with_extension("json.temp");
    let backup_path = path.with_extension("json.bak");

    for candidate in [&temp_path, &backup_path, &path.to_path_buf()] {
        if let Ok(meta) = fs::symlink_metadata(candidate)
            && meta.file_type().is_symlink()
        {
            return Err(anyhow::anyhow!(
                "refusing to write through symlink {}",
                candidate.display()
            ));
        }
    }

    let mut temp_file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)?;
    FileExt::lock_exclusive(&temp_file)?;
    temp_file.write_all(contents)?;
    temp_file.sync_all()?;
    FileExt::unlock(&temp_file)?;
    drop(temp_file);

    if path.exists() {
        fs::rename(path, &backup_path)?;
    }
    fs::rename(&temp_path, path)?;
    if backup_path.exists() {
        let _ = fs::remove_file(&backup_path);
    }

    Ok(())
}

/// A JSON file on disk with crash recovery from its `.temp`/`.bak` siblings.
pub struct Store<T> {
    pub value: T,
    path: PathBuf,
}

impl<T> Store<T>
where
    T: Serialize + DeserializeOwned,
{
    fn read_file(path: &Path) -> Result<T, anyhow::Error> {
        if let Ok(meta) = fs::symlink_metadata(path)
            && meta.file_type().is_symlink()
        {
            return Err(anyhow::anyhow!("refusing to read symlinked store file"));
        }
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Open `<dir>/<id>.json`, falling back to the temp file, then the backup, then `default`.
    pub fn new(id: &str, dir: &Path, default: T) -> Result<Self, anyhow::Error> {
        let path = dir.join(format!("{id}.json"));
        let temp_path = path.with_extension("json.temp");
        let backup_path = path.with_extension("json.bak");

        if let Ok(value) = Self::read_file(&path) {
            let _ = fs::remove_file(&temp_path);
            let _ = fs::remove_file(&backup_path);
            Ok(Self { path, value })
        } else if let Ok(value) = Self::read_file(&temp_path) {
            fs::rename(&temp_path, &path)?;
            Ok(Self { path, value })
        } else if let Ok(value) = Self::read_file(&backup_path) {
            fs::rename(&backup_path, &path)?;
            Ok(Self { path, value })
        } else {
            Ok(Self {
                path,
                value: default,
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<(), anyhow::Error> {
        let value = serde_json::to_value(&self.value)?;
        let bytes = json_value_to_bytes(&value)?;
        write_atomic_bytes(&self.path, &bytes)
            .with_context(|| format!("failed to save {}", self.path.display()))
    }
}

/// Process-wide settings. Controllers receive an immutable snapshot of these.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde_inline_default(30)]
    pub render_fps: u32,
    #[serde_inline_default(1000)]
    pub tick_interval_ms: u64,
    #[serde_inline_default(500)]
    pub hold_threshold_ms: u64,
    #[serde_inline_default(0.7)]
    pub pressed_shrink_factor: f32,
    /// Keep a failing deck open instead of asking the manager to reconnect it.
    #[serde_inline_default(false)]
    pub resume_mode: bool,
    #[serde_inline_default(5)]
    pub max_consecutive_failures: u32,
    #[serde_inline_default(4)]
    pub worker_threads: usize,
    #[serde_inline_default("Roboto".to_owned())]
    pub default_font_family: String,
    #[serde(default)]
    pub font_dirs: Vec<PathBuf>,
    #[serde_inline_default(true)]
    pub video_disk_cache: bool,
    #[serde_inline_default(true)]
    pub low_fps_warning: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        // Every field carries an inline default, so an empty object is a complete document.
        serde_json::from_value(serde_json::json!({})).unwrap_or_else(|_| Self {
            render_fps: 30,
            tick_interval_ms: 1000,
            hold_threshold_ms: 500,
            pressed_shrink_factor: 0.7,
            resume_mode: false,
            max_consecutive_failures: 5,
            worker_threads: 4,
            default_font_family: "Roboto".to_owned(),
            font_dirs: Vec::new(),
            video_disk_cache: true,
            low_fps_warning: true,
        })
    }
}

pub fn get_settings(config_dir: &Path) -> Result<Store<AppSettings>, anyhow::Error> {
    Store::new("settings", config_dir, AppSettings::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_documented_defaults() {
        let settings: AppSettings =
            serde_json::from_value(serde_json::json!({ "render_fps": 60 })).unwrap();
        assert_eq!(settings.render_fps, 60);
        assert_eq!(settings.hold_threshold_ms, 500);
        assert_eq!(settings.max_consecutive_failures, 5);
        assert!((settings.pressed_shrink_factor - 0.7).abs() < f32::EPSILON);
        assert!(!settings.resume_mode);
    }

    #[test]
    fn store_round_trips_and_recovers_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = get_settings(dir.path()).unwrap();
        store.value.render_fps = 15;
        store.save().unwrap();

        let reopened = get_settings(dir.path()).unwrap();
        assert_eq!(reopened.value.render_fps, 15);

        // A crash between the two renames leaves only the backup behind.
        fs::rename(
            dir.path().join("settings.json"),
            dir.path().join("settings.json.bak"),
        )
        .unwrap();
        let recovered = get_settings(dir.path()).unwrap();
        assert_eq!(recovered.value.render_fps, 15);
        assert!(dir.path().join("settings.json").exists());
    }
}
