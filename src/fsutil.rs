//! Small filesystem helpers shared by the worker harness's output
//! publication step.

use std::path::Path;

/// Copies every entry of `src` into `dest` (`dest` must already exist):
/// regular files are copied directly, directories copied recursively. An
/// entry that is neither a file nor a directory (a broken symlink, socket,
/// etc.) is a publication error per `spec.md` §7.
pub fn copy_tree_entries(src: &Path, dest: &Path) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let target = dest.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_file() {
            std::fs::copy(&path, &target)?;
        } else if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree_entries(&path, &target)?;
        } else {
            anyhow::bail!("could not copy entry \"{}\"", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_files_and_nested_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.txt"), "a").unwrap();
        std::fs::write(src.join("nested").join("b.txt"), "b").unwrap();
        std::fs::create_dir_all(&dest).unwrap();

        copy_tree_entries(&src, &dest).unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("a.txt")).unwrap(), "a");
        assert_eq!(
            std::fs::read_to_string(dest.join("nested").join("b.txt")).unwrap(),
            "b"
        );
    }
}
