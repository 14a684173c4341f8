//! Font discovery. Families are matched by name, then by the closest weight and style.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ab_glyph::FontVec;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const MAX_SCAN_DEPTH: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontStyle {
    #[default]
    Normal,
    Italic,
    Oblique,
}

impl FontStyle {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "italic" => FontStyle::Italic,
            "oblique" => FontStyle::Oblique,
            _ => FontStyle::Normal,
        }
    }

    fn is_slanted(self) -> bool {
        self != FontStyle::Normal
    }
}

#[derive(Debug, Clone)]
struct FontFace {
    path: PathBuf,
    family: String,
    weight: u16,
    italic: bool,
}

pub struct LoadedFont {
    pub font: FontVec,
    /// The font only has a Windows symbol cmap; text must be remapped into the
    /// private use area before drawing.
    pub symbol: bool,
}

impl LoadedFont {
    /// Map text for drawing with this font.
    pub fn map_text(&self, text: &str) -> String {
        if !self.symbol {
            return text.to_owned();
        }
        text.chars()
            .map(|c| match u32::from(c) {
                code @ 0x20..=0xff => char::from_u32(0xf000 + code).unwrap_or(c),
                _ => c,
            })
            .collect()
    }
}

type FontKey = (String, u16, FontStyle);

pub struct FontResolver {
    dirs: Vec<PathBuf>,
    default_family: String,
    index: OnceCell<Vec<FontFace>>,
    loaded: Mutex<HashMap<FontKey, Option<Arc<LoadedFont>>>>,
}

impl FontResolver {
    /// Search `extra_dirs` first, then the platform font directories.
    pub fn new(extra_dirs: &[PathBuf], default_family: &str) -> Self {
        let mut dirs: Vec<PathBuf> = extra_dirs.to_vec();
        dirs.extend(system_font_dirs());
        Self::with_dirs(dirs, default_family)
    }

    /// Search only `dirs`.
    pub fn with_dirs(dirs: Vec<PathBuf>, default_family: &str) -> Self {
        Self {
            dirs,
            default_family: default_family.to_owned(),
            index: OnceCell::new(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_family(&self) -> &str {
        &self.default_family
    }

    fn index(&self) -> &[FontFace] {
        self.index.get_or_init(|| {
            let mut faces = Vec::new();
            for dir in &self.dirs {
                scan_dir(dir, 0, &mut faces);
            }
            log::debug!("Indexed {} font faces", faces.len());
            faces
        })
    }

    /// Resolve a font for `family`, falling back to the default family and then to any face.
    /// `None` means no usable font file exists.
    pub fn resolve(&self, family: &str, weight: u16, style: FontStyle) -> Option<Arc<LoadedFont>> {
        let key = (family.to_ascii_lowercase(), weight, style);
        if let Some(hit) = self.loaded.lock().get(&key) {
            return hit.clone();
        }
        let found = self
            .best_match(family, weight, style)
            .or_else(|| self.best_match(&self.default_family, weight, style))
            .or_else(|| self.index().first().cloned())
            .and_then(|face| load_face(&face.path));
        self.loaded.lock().insert(key, found.clone());
        found
    }

    fn best_match(&self, family: &str, weight: u16, style: FontStyle) -> Option<FontFace> {
        self.index()
            .iter()
            .filter(|face| face.family.eq_ignore_ascii_case(family))
            .min_by_key(|face| {
                let weight_distance = (i32::from(face.weight) - i32::from(weight)).unsigned_abs();
                let style_penalty = if face.italic == style.is_slanted() { 0 } else { 1000 };
                weight_distance + style_penalty
            })
            .cloned()
    }
}

fn system_font_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![
        PathBuf::from("/usr/share/fonts"),
        PathBuf::from("/usr/local/share/fonts"),
        PathBuf::from("/Library/Fonts"),
        PathBuf::from("/System/Library/Fonts"),
        PathBuf::from(r"C:\Windows\Fonts"),
    ];
    if let Some(base) = directories::BaseDirs::new() {
        dirs.push(base.data_dir().join("fonts"));
        dirs.push(base.home_dir().join(".fonts"));
    }
    dirs
}

fn scan_dir(dir: &Path, depth: usize, out: &mut Vec<FontFace>) {
    if depth > MAX_SCAN_DEPTH {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_dir(&path, depth + 1, out);
            continue;
        }
        let is_font = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "ttf" | "otf"))
            .unwrap_or(false);
        if !is_font {
            continue;
        }
        let Ok(data) = std::fs::read(&path) else {
            continue;
        };
        let Ok(face) = ttf_parser::Face::parse(&data, 0) else {
            continue;
        };
        let Some(family) = family_name(&face) else {
            continue;
        };
        out.push(FontFace {
            family,
            weight: face.weight().to_number(),
            italic: face.is_italic() || face.is_oblique(),
            path,
        });
    }
}

fn family_name(face: &ttf_parser::Face<'_>) -> Option<String> {
    let names: Vec<_> = face.names().into_iter().collect();
    [ttf_parser::name_id::TYPOGRAPHIC_FAMILY, ttf_parser::name_id::FAMILY]
        .iter()
        .find_map(|id| {
            names
                .iter()
                .filter(|name| name.name_id == *id)
                .find_map(|name| name.to_string())
        })
}

/// Whether the face only carries a Windows symbol (3, 0) cmap subtable.
pub fn is_symbol_font(data: &[u8]) -> bool {
    let Ok(face) = ttf_parser::Face::parse(data, 0) else {
        return false;
    };
    let Some(cmap) = face.tables().cmap else {
        return false;
    };
    let mut symbol = false;
    let mut unicode = false;
    for subtable in cmap.subtables {
        match (subtable.platform_id, subtable.encoding_id) {
            (ttf_parser::PlatformId::Windows, 0) => symbol = true,
            (ttf_parser::PlatformId::Windows, 1 | 10) | (ttf_parser::PlatformId::Unicode, _) => {
                unicode = true
            }
            _ => {}
        }
    }
    symbol && !unicode
}

fn load_face(path: &Path) -> Option<Arc<LoadedFont>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(error) => {
            log::warn!("Failed to read font {}: {error}", path.display());
            return None;
        }
    };
    let symbol = is_symbol_font(&data);
    match FontVec::try_from_vec(data) {
        Ok(font) => Some(Arc::new(LoadedFont { font, symbol })),
        Err(error) => {
            log::warn!("Failed to parse font {}: {error}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_font_dirs_resolve_to_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FontResolver::with_dirs(vec![dir.path().to_path_buf()], "Roboto");
        assert!(resolver.resolve("Roboto", 400, FontStyle::Normal).is_none());
        assert_eq!(resolver.default_family(), "Roboto");
    }

    #[test]
    fn non_font_bytes_are_not_symbol_fonts() {
        assert!(!is_symbol_font(b"definitely not a font"));
    }

    #[test]
    fn parses_style_names() {
        assert_eq!(FontStyle::parse("Italic"), FontStyle::Italic);
        assert_eq!(FontStyle::parse("bold"), FontStyle::Normal);
    }
}
