//! Digest walk over the local root.

use crate::error::CoreError;
use crate::file::sidecar::SIDECAR_FILE;
use meshvault_crypto::ContentDigest;
use std::collections::BTreeMap;
use std::path::Path;

/// Digest every file under `root`, keyed by root-relative path with `/`
/// separators. The sidecar itself is not part of the tree.
pub fn digest_tree(root: &Path) -> Result<BTreeMap<String, ContentDigest>, CoreError> {
    let mut digests = BTreeMap::new();
    walk(root, Path::new(""), &mut digests)?;
    Ok(digests)
}

fn walk(
    absolute: &Path,
    relative: &Path,
    digests: &mut BTreeMap<String, ContentDigest>,
) -> Result<(), CoreError> {
    for entry in std::fs::read_dir(absolute)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if relative.as_os_str().is_empty() && name == SIDECAR_FILE {
            continue;
        }

        let child_abs = entry.path();
        let child_rel = relative.join(name.as_ref());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&child_abs, &child_rel, digests)?;
        } else if file_type.is_file() {
            let key = child_rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            digests.insert(key, ContentDigest::from_file(&child_abs)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_tree_walks_nested_folders() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/deep")).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"top").unwrap();
        std::fs::write(dir.path().join("docs/deep/a.bin"), b"deep").unwrap();
        std::fs::write(dir.path().join(SIDECAR_FILE), b"{}").unwrap();

        let digests = digest_tree(dir.path()).unwrap();

        assert_eq!(digests.len(), 2);
        assert_eq!(
            digests.get("top.txt"),
            Some(&ContentDigest::from_data(b"top"))
        );
        assert_eq!(
            digests.get("docs/deep/a.bin"),
            Some(&ContentDigest::from_data(b"deep"))
        );
        assert!(!digests.contains_key(SIDECAR_FILE));
    }
}
