// cacti/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::info;
use walkdir::WalkDir;

use crate::backup::naming::tarball_name;
use crate::errors::BackupError;

/// Creates a GZipped TAR archive from a source directory.
///
/// Entries are stored under the directory's own base name, so unpacking the
/// archive recreates `source_dir` rather than spilling its contents.
///
/// # Arguments
/// * `source_dir` - The directory to archive.
/// * `archive_dest_path` - The full path where the `.tar.gz` archive will be created.
///
/// # Returns
/// Path to the created archive file.
pub fn create_tar_gz_archive(source_dir: &Path, archive_dest_path: &Path) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        ));
    }
    let root_name = source_dir
        .file_name()
        .with_context(|| format!("Directory has no base name: {}", source_dir.display()))?;
    if let Some(parent) = archive_dest_path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create parent directory for archive: {}",
                    parent.display()
                )
            })?;
        }
    }

    let archive_file = File::create(archive_dest_path).with_context(|| {
        format!(
            "Failed to create archive file: {}",
            archive_dest_path.display()
        )
    })?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry
            .with_context(|| format!("Failed to walk directory: {}", source_dir.display()))?;
        let path = entry.path();
        let relative = path.strip_prefix(source_dir).with_context(|| {
            format!(
                "Failed to strip prefix {} from {}",
                source_dir.display(),
                path.display()
            )
        })?;
        let name = if relative.as_os_str().is_empty() {
            PathBuf::from(root_name)
        } else {
            Path::new(root_name).join(relative)
        };

        if entry.file_type().is_dir() {
            tar_builder.append_dir(&name, path).with_context(|| {
                format!("Failed to append directory {} to archive", path.display())
            })?;
        } else if entry.file_type().is_file() {
            tar_builder.append_path_with_name(path, &name).with_context(|| {
                format!(
                    "Failed to append file {} as {} to archive",
                    path.display(),
                    name.display()
                )
            })?;
        }
    }

    let encoder = tar_builder.into_inner().with_context(|| {
        format!(
            "Failed to get inner encoder from tar builder for archive: {}",
            archive_dest_path.display()
        )
    })?;
    encoder.finish().with_context(|| {
        format!(
            "Failed to finish Gzip encoding for archive: {}",
            archive_dest_path.display()
        )
    })?;

    Ok(archive_dest_path.to_path_buf())
}

/// Archives a directory-shaped snapshot into `dest_dir` and removes the directory.
///
/// On failure the source directory is left where it is.
pub async fn package_directory(source_dir: &Path, dest_dir: &Path) -> crate::errors::Result<PathBuf> {
    let archive_path = dest_dir.join(tarball_name(source_dir));
    info!(
        source = %source_dir.display(),
        archive = %archive_path.display(),
        "packaging snapshot directory"
    );

    let source = source_dir.to_path_buf();
    let dest = archive_path.clone();
    let packaged = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        let archive = create_tar_gz_archive(&source, &dest)?;
        std::fs::remove_dir_all(&source)
            .with_context(|| format!("Failed to remove packaged directory: {}", source.display()))?;
        Ok(archive)
    })
    .await
    .map_err(|e| BackupError::PackagingFailed {
        path: source_dir.to_path_buf(),
        detail: format!("packaging task did not complete: {}", e),
    })?;

    packaged.map_err(|e| BackupError::PackagingFailed {
        path: source_dir.to_path_buf(),
        detail: format!("{:#}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn archive_entries(archive_path: &Path) -> anyhow::Result<Vec<String>> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive_path)?));
        let mut names = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            names.push(entry.path()?.to_string_lossy().trim_end_matches('/').to_string());
        }
        Ok(names)
    }

    #[tokio::test]
    async fn test_package_directory_roots_archive_at_base_name() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let snapshot = root.path().join("2024-05-01T12:00:00.000Z");
        std::fs::create_dir_all(snapshot.join("app"))?;
        std::fs::write(snapshot.join("app").join("users.bson"), b"bson")?;

        let archive = package_directory(&snapshot, root.path()).await?;
        assert_eq!(archive, root.path().join("2024-05-01T12:00:00.000Z.tar.gz"));
        assert!(archive.is_file());
        assert!(!snapshot.exists(), "source directory should be removed");

        let entries = archive_entries(&archive)?;
        assert_eq!(
            entries,
            vec![
                "2024-05-01T12:00:00.000Z",
                "2024-05-01T12:00:00.000Z/app",
                "2024-05-01T12:00:00.000Z/app/users.bson",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_package_missing_directory_fails() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let err = package_directory(&root.path().join("missing"), root.path())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::PackagingFailed { .. }));
        Ok(())
    }
}
