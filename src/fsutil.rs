use std::path::{Path, PathBuf};

/// Rewrites `name[.NNNN].ext` as `name.{iter:04}.ext`, replacing any
/// existing numeric suffix.
pub fn filename_with_suffix(path: &Path, iter: u32) -> PathBuf {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut stem = match path.file_stem() {
        Some(s) => PathBuf::from(s),
        None => return path.to_path_buf(),
    };

    // Strip an existing .NNNN counter from the stem.
    if let Some(inner_ext) = stem.extension() {
        if inner_ext.to_string_lossy().parse::<u32>().is_ok() {
            stem = stem.with_extension("");
        }
    }

    let name = if ext.is_empty() {
        format!("{}.{iter:04}", stem.to_string_lossy())
    } else {
        format!("{}.{iter:04}.{ext}", stem.to_string_lossy())
    };

    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Instantiates the first suffixed variant of `path` that does not exist
/// yet, returning the path and the iteration number. A missing parent
/// directory is not an error; the caller gets iteration 0 there.
pub fn filename_without_overwrite(path: &Path) -> std::io::Result<(PathBuf, u32)> {
    let mut iter = 0;
    loop {
        let candidate = filename_with_suffix(path, iter);
        match std::fs::metadata(&candidate) {
            Ok(_) => iter += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((candidate, iter));
            }
            Err(e) => return Err(e),
        }
    }
}
