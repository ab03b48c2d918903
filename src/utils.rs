use std::path::{Path, PathBuf};
use url::Url;

use crate::item::DownloadItem;

pub fn get_filename_from_url(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    let segment = url.path_segments()?.last()?;
    if segment.is_empty() {
        return None;
    }
    Some(segment.to_string())
}

/// Name the finished file should get: explicit name, URL path, or a generated one.
pub fn suggested_file_name(item: &DownloadItem) -> String {
    let name = item
        .file_name
        .clone()
        .or_else(|| get_filename_from_url(&item.url))
        .unwrap_or_else(|| format!("download_{}", item.id));
    sanitize_filename(&name)
}

pub fn sanitize_filename(filename: &str) -> String {
    let cleaned = filename.replace(
        |c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_',
        "_",
    );
    if cleaned.trim_matches('.').is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

/// First path under `dir` named `filename` (or `stem_N.ext`) that does not exist yet.
pub fn get_unique_filepath(dir: &Path, filename: &str) -> PathBuf {
    let mut path = dir.join(filename);
    let original = Path::new(filename);
    let file_stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string());
    let extension = original
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut counter = 1;

    while path.exists() {
        let new_filename = if extension.is_empty() {
            format!("{}_{}", file_stem, counter)
        } else {
            format!("{}_{}.{}", file_stem, counter, extension)
        };

        path = dir.join(new_filename);
        counter += 1;
    }
    path
}
