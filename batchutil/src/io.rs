use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Deserializes a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &str) -> Result<T> {
    let contents = fs_err::read_to_string(path)?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path))
}

pub fn basename<I: AsRef<str>>(path: I) -> String {
    std::path::Path::new(path.as_ref())
        .file_stem()
        .unwrap()
        .to_os_string()
        .into_string()
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_dirs_and_extension() {
        assert_eq!(basename("foo/bar/baz.rou.xml"), "baz.rou");
        assert_eq!(basename("baz.txt"), "baz");
        assert_eq!(basename("no_extension"), "no_extension");
    }
}
