//! SFTP channel
//!
//! File operations bound to one authenticated transport. Every transfer is
//! chunked and reports progress after each chunk; a progress callback that
//! returns `false` aborts with [`SftpError::Cancelled`] and drops the remote
//! file handle, leaving the channel usable.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::backend::RemoteFs;
use super::error::SftpError;
use super::path_utils::{file_name, is_root, join_remote_path, resolve_remote_path};
use super::progress::ProgressFn;
use super::types::{RemoteFileEntry, RemoteMetadata};

/// Result of a recursive removal
#[derive(Debug)]
pub enum RemoveOutcome {
    /// Everything is gone; number of files and directories removed
    Removed(u64),
    /// Stopped at the first failure, nothing after it was attempted
    FailedAt { path: String, error: SftpError },
    /// The root path is not a directory
    NotADirectory,
}

pub struct SftpChannel {
    fs: Box<dyn RemoteFs>,
    chunk_size: usize,
    /// Login directory, target of `~`
    home: String,
}

impl SftpChannel {
    /// Bind to `fs` and cache the login directory.
    pub async fn open(fs: Box<dyn RemoteFs>, chunk_size: usize) -> Result<Self, SftpError> {
        let home = fs.canonicalize(".").await?;
        debug!("SFTP home directory: {}", home);
        Ok(Self {
            fs,
            chunk_size: chunk_size.max(1),
            home,
        })
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    /// Absolute form of `path`: `~` is the login directory, relative paths
    /// are taken from it too.
    pub fn resolve(&self, path: &str) -> String {
        resolve_remote_path(path, &self.home, &self.home)
    }

    /// Directory contents, directories first then case-insensitive name.
    pub async fn list(&self, path: &str) -> Result<Vec<RemoteFileEntry>, SftpError> {
        let dir = self.resolve(path);
        debug!("Listing directory: {}", dir);

        let mut entries: Vec<RemoteFileEntry> = self
            .fs
            .read_dir(&dir)
            .await?
            .into_iter()
            .map(|e| {
                let full_path = join_remote_path(&dir, &e.name);
                RemoteFileEntry::from_metadata(e.name, full_path, &e.metadata)
            })
            .collect();

        entries.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        debug!("Listed {} entries in {}", entries.len(), dir);
        Ok(entries)
    }

    pub async fn stat(&self, path: &str) -> Result<RemoteFileEntry, SftpError> {
        let resolved = self.resolve(path);
        let meta = self.fs.metadata(&resolved).await?;
        let name = if is_root(&resolved) {
            "/".to_string()
        } else {
            file_name(&resolved).to_string()
        };
        Ok(RemoteFileEntry::from_metadata(name, resolved, &meta))
    }

    /// Raw metadata, for paths already resolved
    pub async fn metadata(&self, path: &str) -> Result<RemoteMetadata, SftpError> {
        self.fs.metadata(path).await
    }

    /// Download `path` into memory.
    pub async fn read(&self, path: &str, progress: &mut ProgressFn<'_>) -> Result<Vec<u8>, SftpError> {
        let mut buf = Vec::new();
        self.read_to(path, &mut buf, progress).await?;
        Ok(buf)
    }

    /// Download `path` into `writer`. Returns the byte count.
    pub async fn read_to<W>(
        &self,
        path: &str,
        writer: &mut W,
        progress: &mut ProgressFn<'_>,
    ) -> Result<u64, SftpError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let resolved = self.resolve(path);
        let meta = self.fs.metadata(&resolved).await?;
        if meta.is_dir() {
            return Err(SftpError::IsADirectory(resolved));
        }
        let total = meta.size.unwrap_or(0);

        let mut reader = self.fs.open_read(&resolved).await?;
        let done = pump(
            &mut reader,
            writer,
            total,
            self.chunk_size,
            progress,
            |e| SftpError::from_remote_io(e, &resolved),
            SftpError::Io,
        )
        .await?;

        writer.flush().await?;
        info!("Downloaded {} ({} bytes)", resolved, done);
        Ok(done)
    }

    /// Upload `bytes` to `path`, replacing it.
    pub async fn write(
        &self,
        bytes: &[u8],
        path: &str,
        progress: &mut ProgressFn<'_>,
    ) -> Result<u64, SftpError> {
        let mut reader = bytes;
        self.write_from(&mut reader, bytes.len() as u64, path, progress)
            .await
    }

    /// Upload everything `reader` yields to `path`, replacing it.
    pub async fn write_from<R>(
        &self,
        reader: &mut R,
        total: u64,
        path: &str,
        progress: &mut ProgressFn<'_>,
    ) -> Result<u64, SftpError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let resolved = self.resolve(path);
        let mut remote = self.fs.open_write(&resolved).await?;

        let done = pump(
            reader,
            &mut remote,
            total,
            self.chunk_size,
            progress,
            SftpError::Io,
            |e| SftpError::from_remote_io(e, &resolved),
        )
        .await?;

        remote
            .shutdown()
            .await
            .map_err(|e| SftpError::from_remote_io(e, &resolved))?;
        info!("Uploaded {} ({} bytes)", resolved, done);
        Ok(done)
    }

    /// Server-side copy of a regular file, streamed through the client.
    ///
    /// Opening the destination truncates it, so copying a file onto itself
    /// is refused before anything is opened.
    pub async fn copy(
        &self,
        source: &str,
        dest: &str,
        progress: &mut ProgressFn<'_>,
    ) -> Result<u64, SftpError> {
        let source = self.resolve(source);
        let dest = self.resolve(dest);
        if source == dest {
            return Err(SftpError::SameFile(source));
        }

        let meta = self.fs.metadata(&source).await?;
        if meta.is_dir() {
            return Err(SftpError::IsADirectory(source));
        }
        let total = meta.size.unwrap_or(0);

        let mut reader = self.fs.open_read(&source).await?;
        let mut writer = self.fs.open_write(&dest).await?;

        let done = pump(
            &mut reader,
            &mut writer,
            total,
            self.chunk_size,
            progress,
            |e| SftpError::from_remote_io(e, &source),
            |e| SftpError::from_remote_io(e, &dest),
        )
        .await?;

        writer
            .shutdown()
            .await
            .map_err(|e| SftpError::from_remote_io(e, &dest))?;
        info!("Copied {} to {} ({} bytes)", source, dest, done);
        Ok(done)
    }

    pub async fn move_item(&self, source: &str, dest: &str) -> Result<(), SftpError> {
        let source = self.resolve(source);
        let dest = self.resolve(dest);
        info!("Moving {} to {}", source, dest);
        self.fs.rename(&source, &dest).await
    }

    /// Remove a file or an empty directory.
    pub async fn remove(&self, path: &str) -> Result<(), SftpError> {
        let resolved = self.resolve(path);
        info!("Removing {}", resolved);

        let meta = self.fs.metadata(&resolved).await?;
        if meta.is_dir() {
            self.fs.remove_dir(&resolved).await
        } else {
            self.fs.remove_file(&resolved).await
        }
    }

    /// Remove a directory tree, depth first, stopping at the first failure.
    pub async fn remove_tree(&self, path: &str) -> RemoveOutcome {
        let resolved = self.resolve(path);

        match self.fs.metadata(&resolved).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return RemoveOutcome::NotADirectory,
            Err(error) => {
                return RemoveOutcome::FailedAt {
                    path: resolved,
                    error,
                }
            }
        }

        info!("Recursively removing {}", resolved);
        match self.remove_tree_inner(&resolved).await {
            Ok(count) => RemoveOutcome::Removed(count),
            Err((path, error)) => {
                warn!("Recursive removal stopped at {}: {}", path, error);
                RemoveOutcome::FailedAt { path, error }
            }
        }
    }

    /// [`remove_tree`](Self::remove_tree) as a `Result`
    pub async fn remove_directory_recursive(&self, path: &str) -> Result<u64, SftpError> {
        match self.remove_tree(path).await {
            RemoveOutcome::Removed(count) => Ok(count),
            RemoveOutcome::NotADirectory => Err(SftpError::NotADirectory(self.resolve(path))),
            RemoveOutcome::FailedAt { path, error } => Err(SftpError::RemoveFailed {
                path,
                source: Box::new(error),
            }),
        }
    }

    /// Files of `dir` first, then each subdirectory recursively, then `dir`.
    async fn remove_tree_inner(&self, dir: &str) -> Result<u64, (String, SftpError)> {
        let entries = self
            .fs
            .read_dir(dir)
            .await
            .map_err(|e| (dir.to_string(), e))?;

        let (subdirs, files): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.metadata.is_dir());

        let mut removed = 0u64;
        for file in files {
            let path = join_remote_path(dir, &file.name);
            self.fs
                .remove_file(&path)
                .await
                .map_err(|e| (path.clone(), e))?;
            removed += 1;
        }

        for sub in subdirs {
            let path = join_remote_path(dir, &sub.name);
            // Boxed: recursive async fn
            removed += Box::pin(self.remove_tree_inner(&path)).await?;
        }

        self.fs
            .remove_dir(dir)
            .await
            .map_err(|e| (dir.to_string(), e))?;
        Ok(removed + 1)
    }

    pub async fn create_directory(&self, path: &str) -> Result<(), SftpError> {
        let resolved = self.resolve(path);
        info!("Creating directory: {}", resolved);
        self.fs.create_dir(&resolved).await
    }

    /// Create (or truncate) a zero-length file
    pub async fn create_empty_file(&self, path: &str) -> Result<(), SftpError> {
        let resolved = self.resolve(path);
        info!("Creating file: {}", resolved);
        let mut file = self.fs.open_write(&resolved).await?;
        file.shutdown()
            .await
            .map_err(|e| SftpError::from_remote_io(e, &resolved))
    }

    pub async fn close(&self) {
        self.fs.close().await;
    }
}

/// Copy `reader` to `writer` chunk by chunk, reporting after each chunk.
async fn pump<R, W, RE, WE>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    chunk_size: usize,
    progress: &mut ProgressFn<'_>,
    read_err: RE,
    write_err: WE,
) -> Result<u64, SftpError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    W: AsyncWrite + Unpin + Send + ?Sized,
    RE: Fn(std::io::Error) -> SftpError,
    WE: Fn(std::io::Error) -> SftpError,
{
    let mut buffer = vec![0u8; chunk_size];
    let mut done = 0u64;

    loop {
        let n = reader.read(&mut buffer).await.map_err(&read_err)?;
        if n == 0 {
            break;
        }

        writer.write_all(&buffer[..n]).await.map_err(&write_err)?;
        done += n as u64;

        if !progress(done, total.max(done)) {
            info!("Transfer cancelled at {} bytes", done);
            return Err(SftpError::Cancelled);
        }
    }

    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryFs;

    async fn channel(fs: &MemoryFs, chunk: usize) -> SftpChannel {
        SftpChannel::open(Box::new(fs.clone()), chunk).await.unwrap()
    }

    #[tokio::test]
    async fn test_resolve_uses_home() {
        let fs = MemoryFs::with_home("/home/u");
        let ch = channel(&fs, 4).await;
        assert_eq!(ch.resolve("~"), "/home/u");
        assert_eq!(ch.resolve("docs"), "/home/u/docs");
        assert_eq!(ch.resolve("/etc/../tmp"), "/tmp");
    }

    #[tokio::test]
    async fn test_list_sorted_dirs_first() {
        let fs = MemoryFs::with_home("/home/u");
        fs.add_file("/home/u/b.txt", b"b");
        fs.add_file("/home/u/A.txt", b"a");
        fs.add_dir("/home/u/zdir");
        let ch = channel(&fs, 4).await;

        let names: Vec<_> = ch.list("~").await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["zdir", "A.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let fs = MemoryFs::with_home("/home/u");
        let ch = channel(&fs, 3).await;
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let written = ch.write(&data, "~/blob.bin", &mut |_, _| true).await.unwrap();
        assert_eq!(written, 1000);

        let back = ch.read("/home/u/blob.bin", &mut |_, _| true).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_write_cancelled_on_nth_chunk() {
        let fs = MemoryFs::with_home("/home/u");
        let ch = channel(&fs, 4).await;
        let data = vec![7u8; 40];

        let mut calls = 0;
        let result = ch
            .write(&data, "/home/u/f", &mut |_, _| {
                calls += 1;
                calls < 3
            })
            .await;

        assert!(matches!(result, Err(SftpError::Cancelled)));
        assert_eq!(calls, 3);
        assert_eq!(fs.file_contents("/home/u/f").unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_read_cancelled_reports_bounded_bytes() {
        let fs = MemoryFs::with_home("/home/u");
        fs.add_file("/home/u/f", &[1u8; 100]);
        let ch = channel(&fs, 10).await;

        let mut last = 0;
        let result = ch
            .read("f", &mut |done, total| {
                assert_eq!(total, 100);
                last = done;
                done < 20
            })
            .await;
        assert!(matches!(result, Err(SftpError::Cancelled)));
        assert_eq!(last, 20);

        // Channel still usable
        assert_eq!(ch.read("f", &mut |_, _| true).await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_rejected_write() {
        let fs = MemoryFs::with_home("/home/u");
        fs.reject_writes_to("/home/u/ro");
        let ch = channel(&fs, 8).await;

        let result = ch.write(b"data", "ro", &mut |_, _| true).await;
        assert!(matches!(result, Err(SftpError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_copy_and_move() {
        let fs = MemoryFs::with_home("/home/u");
        fs.add_file("/home/u/a.txt", b"hello");
        fs.add_dir("/home/u/d");
        let ch = channel(&fs, 2).await;

        ch.copy("a.txt", "d/a.txt", &mut |_, _| true).await.unwrap();
        assert_eq!(fs.file_contents("/home/u/d/a.txt").unwrap(), b"hello");
        assert!(matches!(
            ch.copy("d", "e", &mut |_, _| true).await,
            Err(SftpError::IsADirectory(_))
        ));

        ch.move_item("a.txt", "b.txt").await.unwrap();
        assert!(fs.file_contents("/home/u/a.txt").is_none());
        assert_eq!(fs.file_contents("/home/u/b.txt").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_copy_onto_itself_keeps_contents() {
        let fs = MemoryFs::with_home("/home/u");
        fs.add_file("/home/u/a.txt", b"hello");
        let ch = channel(&fs, 2).await;

        let result = ch.copy("a.txt", "~/./a.txt", &mut |_, _| true).await;
        assert!(matches!(result, Err(SftpError::SameFile(p)) if p == "/home/u/a.txt"));
        assert_eq!(fs.file_contents("/home/u/a.txt").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_read_sees_truncation_after_open() {
        let fs = MemoryFs::with_home("/home/u");
        fs.add_file("/home/u/a.txt", b"hello");

        let mut reader = fs.open_read("/home/u/a.txt").await.unwrap();
        let _writer = fs.open_write("/home/u/a.txt").await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_remove_tree_order() {
        let fs = MemoryFs::with_home("/");
        fs.add_dir("/a");
        fs.add_file("/a/b.txt", b"b");
        fs.add_dir("/a/c");
        fs.add_file("/a/c/d.txt", b"d");
        let ch = channel(&fs, 8).await;

        assert!(matches!(ch.remove_tree("/a").await, RemoveOutcome::Removed(4)));

        let log = fs.removal_log();
        let pos = |p: &str| log.iter().position(|x| x == p).unwrap();
        assert!(pos("/a/b.txt") < pos("/a/c"));
        assert!(pos("/a/c/d.txt") < pos("/a/c"));
        assert!(pos("/a/c") < pos("/a"));
    }

    #[tokio::test]
    async fn test_remove_tree_fail_fast() {
        let fs = MemoryFs::with_home("/");
        fs.add_dir("/a");
        fs.add_file("/a/b.txt", b"b");
        fs.add_dir("/a/c");
        fs.add_file("/a/c/d.txt", b"d");
        fs.fail_removal_of("/a/c/d.txt");
        let ch = channel(&fs, 8).await;

        match ch.remove_tree("/a").await {
            RemoveOutcome::FailedAt { path, .. } => assert_eq!(path, "/a/c/d.txt"),
            other => panic!("expected FailedAt, got {:?}", other),
        }
        let log = fs.removal_log();
        assert!(!log.contains(&"/a/c".to_string()));
        assert!(!log.contains(&"/a".to_string()));
        assert!(fs.exists("/a/c"));
        assert!(fs.exists("/a"));

        assert!(matches!(
            ch.remove_directory_recursive("/a").await,
            Err(SftpError::RemoveFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_tree_on_file() {
        let fs = MemoryFs::with_home("/");
        fs.add_file("/f", b"x");
        let ch = channel(&fs, 8).await;
        assert!(matches!(ch.remove_tree("/f").await, RemoveOutcome::NotADirectory));
        assert!(matches!(
            ch.remove_directory_recursive("/f").await,
            Err(SftpError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_create_and_remove() {
        let fs = MemoryFs::with_home("/home/u");
        let ch = channel(&fs, 8).await;

        ch.create_directory("new").await.unwrap();
        ch.create_empty_file("new/empty").await.unwrap();
        assert_eq!(fs.file_contents("/home/u/new/empty").unwrap(), b"");
        assert!(ch.stat("new").await.unwrap().is_directory);

        ch.remove("new/empty").await.unwrap();
        ch.remove("new").await.unwrap();
        assert!(!fs.exists("/home/u/new"));
        assert!(matches!(ch.stat("new").await, Err(SftpError::NotFound(_))));
    }
}
