use anyhow::{Context, Error, ensure};
use futures::StreamExt;
use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::fs;
use tokio_stream::wrappers::ReadDirStream;

#[derive(Clone, Debug)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

pub async fn ensure_directory(path: &Path) -> Result<(), Error> {
    if !path.exists() {
        fs::create_dir_all(path).await.context("create_dir_all")?;
    }

    let metadata = fs::metadata(path).await.context("metadata")?;
    ensure!(metadata.is_dir(), "path is not a directory: {:?}", path);

    Ok(())
}

// Non-recursive listing of regular files, newest modification first. A
// missing directory yields an empty listing.
pub async fn list_files_by_mtime_desc(directory: &Path) -> Result<Vec<FileEntry>, Error> {
    let mut entries = Vec::<FileEntry>::new();

    let read_dir = match fs::read_dir(directory).await {
        Ok(read_dir) => read_dir,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(error) => return Err(error).context("read_dir"),
    };

    let mut read_dir_stream = ReadDirStream::new(read_dir);
    while let Some(entry) = read_dir_stream.next().await {
        let entry = entry.context("entry")?;

        let metadata = entry.metadata().await.context("metadata")?;
        if !metadata.is_file() {
            continue;
        }

        let modified = metadata.modified().context("modified")?;

        entries.push(FileEntry {
            path: entry.path(),
            size: metadata.len(),
            modified,
        });
    }

    entries.sort_by(|left, right| right.modified.cmp(&left.modified));

    Ok(entries)
}

// Total size of regular files in the directory tree. A missing root counts
// as zero.
pub async fn directory_size(directory: &Path) -> Result<u64, Error> {
    let mut total: u64 = 0;

    let mut pending = vec![directory.to_path_buf()];
    while let Some(directory) = pending.pop() {
        let read_dir = match fs::read_dir(&directory).await {
            Ok(read_dir) => read_dir,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
            Err(error) => return Err(error).context("read_dir"),
        };

        let mut read_dir_stream = ReadDirStream::new(read_dir);
        while let Some(entry) = read_dir_stream.next().await {
            let entry = entry.context("entry")?;

            let metadata = entry.metadata().await.context("metadata")?;
            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}
