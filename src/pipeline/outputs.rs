/// Output snapshot archiving and restoration
///
/// A successful step's declared outputs are packed into a tar+zstd archive
/// stored next to its cache entry. On a cache hit the archive is unpacked into
/// the working root so the step's layer is present even in a fresh root.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path};
use tar::{Archive, Builder};
use zstd::{decode_all, encode_all};

/// Information about an archived output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedOutput {
    pub path: String,
    pub artifact_hash: String,
    pub size_bytes: u64,
    pub file_count: usize,
    pub is_directory: bool,
}

/// Archive outputs (paths relative to `root`) into a tar+zstd file
pub fn archive_outputs(
    outputs: &[String],
    root: &Path,
    archive_path: &Path,
) -> Result<Vec<ArchivedOutput>> {
    let mut tar_data = Vec::new();
    let mut tar = Builder::new(&mut tar_data);

    let mut archived = Vec::new();

    for output in outputs {
        let relative = output.trim_end_matches('/');
        if !is_contained(relative) {
            anyhow::bail!("Output must be a relative path inside the working root: {}", output);
        }

        let output_path = root.join(relative);
        if !output_path.exists() {
            anyhow::bail!("Declared output not found: {}", output);
        }

        let is_directory = output_path.is_dir();
        let (size_bytes, file_count) = if is_directory {
            tar.append_dir_all(relative, &output_path)
                .with_context(|| format!("Failed to archive directory: {}", output))?;
            dir_size_and_count(&output_path)?
        } else {
            let mut file = File::open(&output_path)
                .with_context(|| format!("Failed to open file: {}", output))?;
            tar.append_file(relative, &mut file)
                .with_context(|| format!("Failed to archive file: {}", output))?;
            (file.metadata()?.len(), 1)
        };

        archived.push(ArchivedOutput {
            path: output.clone(),
            artifact_hash: path_hash(&output_path)?,
            size_bytes,
            file_count,
            is_directory,
        });
    }

    tar.finish().context("Failed to finalize tar archive")?;
    drop(tar);

    let compressed =
        encode_all(tar_data.as_slice(), 3).context("Failed to compress archive with zstd")?;

    let mut file = File::create(archive_path)
        .with_context(|| format!("Failed to create archive: {}", archive_path.display()))?;
    file.write_all(&compressed)
        .context("Failed to write compressed archive")?;

    Ok(archived)
}

/// Extract a tar+zstd archive into `root`
pub fn extract_outputs(archive_path: &Path, root: &Path) -> Result<()> {
    let compressed = fs::read(archive_path)
        .with_context(|| format!("Failed to read archive: {}", archive_path.display()))?;

    let tar_data =
        decode_all(compressed.as_slice()).context("Failed to decompress archive with zstd")?;

    fs::create_dir_all(root)
        .with_context(|| format!("Failed to create working root: {}", root.display()))?;

    let mut archive = Archive::new(tar_data.as_slice());
    archive
        .unpack(root)
        .with_context(|| format!("Failed to extract archive to: {}", root.display()))?;

    Ok(())
}

/// Outputs may not escape the working root
fn is_contained(relative: &str) -> bool {
    let path = Path::new(relative);
    !relative.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// SHA-256 of a file, or of every file in a directory in name order
fn path_hash(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();

    if path.is_dir() {
        for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() {
                hasher.update(fs::read(entry.path())?);
            }
        }
    } else {
        hasher.update(fs::read(path)?);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn dir_size_and_count(path: &Path) -> Result<(u64, usize)> {
    let mut total_size = 0;
    let mut file_count = 0;

    for entry in walkdir::WalkDir::new(path) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total_size += entry.metadata()?.len();
            file_count += 1;
        }
    }

    Ok((total_size, file_count))
}
