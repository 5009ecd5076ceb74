//! File tree helpers for the cache and artifact stages

use std::io;
use std::path::Path;

/// Copy a file, symlink or directory tree to `target`, creating parents.
/// Symlinks are recreated, not followed.
pub fn copy_path(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let meta = std::fs::symlink_metadata(source)?;
    if meta.file_type().is_symlink() {
        let link = std::fs::read_link(source)?;
        std::os::unix::fs::symlink(link, target)
    } else if meta.is_dir() {
        std::fs::create_dir_all(target)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_path(&entry.path(), &target.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        std::fs::copy(source, target).map(|_| ())
    }
}

/// Remove a file, symlink or directory tree; missing paths are fine
pub fn remove_path(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_tree_with_symlink() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("venv/bin")).unwrap();
        std::fs::write(src.path().join("venv/pyvenv.cfg"), "home = /usr/bin\n").unwrap();
        std::os::unix::fs::symlink("/usr/bin/python3", src.path().join("venv/bin/python")).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("nested/venv");
        copy_path(&src.path().join("venv"), &target).unwrap();

        assert_eq!(
            std::fs::read_to_string(target.join("pyvenv.cfg")).unwrap(),
            "home = /usr/bin\n"
        );
        assert_eq!(
            std::fs::read_link(target.join("bin/python")).unwrap(),
            Path::new("/usr/bin/python3")
        );

        remove_path(&target).unwrap();
        assert!(!target.exists());
        remove_path(&target).unwrap();
    }
}
