use std::{fs, path::PathBuf};

pub fn expand_path(path: &str) -> PathBuf {
    // Expand `~` and `$VAR` environment variables; keep the input as-is
    // when a variable is undefined
    let expanded = shellexpand::full(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_owned());

    // Convert to an absolute canonicalized path
    fs::canonicalize(&expanded).unwrap_or_else(|_| PathBuf::from(expanded)) // Fallback if the path doesn't exist
}
