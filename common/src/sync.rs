//! Directory synchronization over a [`FileChannel`]
//!
//! Trees are walked in a deterministic order: the entries of each directory are sorted by
//! name, files are handled before descending into subdirectories. Every file goes through
//! the skip policy, first match wins:
//!
//! 1. the relative path matches the skip pattern
//! 2. the file is larger than the size limit
//! 3. the destination already has an entry of the same size and overwrite is off
//! 4. otherwise the file is transferred
//!
//! A failed transfer is counted and the walk moves on. So is a subdirectory that cannot be
//! read or listed: its subtree is left out and the rest of the walk continues. Only a root
//! that cannot be walked at all aborts the sync.

use anyhow::Context;
use enum_map::{Enum, EnumMap};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::filter::SkipPattern;
use crate::result::OperationResult;
use crate::transport::{FileChannel, remote_join};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// files larger than this many MiB are skipped, `None` or 0 disables the check
    pub skip_size_mb: Option<f64>,
    pub skip_pattern: Option<SkipPattern>,
    /// transfer even when the destination has a same-sized entry
    pub overwrite: bool,
    /// log every per-file decision at INFO instead of DEBUG
    pub show_progress: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            skip_size_mb: None,
            skip_pattern: None,
            overwrite: false,
            show_progress: true,
        }
    }
}

impl SyncSettings {
    fn exceeds_size_limit(&self, size: u64) -> bool {
        match self.skip_size_mb {
            Some(limit) if limit > 0.0 => size as f64 > limit * BYTES_PER_MB,
            _ => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum, Serialize, Deserialize)]
pub enum SkipReason {
    Pattern,
    Size,
    Exists,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Upload,
    Download,
}

/// Per-call accounting of a tree sync
///
/// `files_transferred + files_skipped + files_errored` is the number of files visited and
/// `skipped_by` always sums to `files_skipped`. `dirs_errored` counts subdirectories whose
/// contents were never visited.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    pub files_transferred: u64,
    pub files_skipped: u64,
    pub files_errored: u64,
    #[serde(default)]
    pub dirs_errored: u64,
    pub skipped_by: EnumMap<SkipReason, u64>,
}

impl SyncCounters {
    pub fn files_visited(&self) -> u64 {
        self.files_transferred + self.files_skipped + self.files_errored
    }

    fn skip(&mut self, reason: SkipReason) {
        self.files_skipped += 1;
        self.skipped_by[reason] += 1;
    }

    /// Human-readable one-line summary, unreadable directories count as errors
    pub fn summary(&self, direction: Direction) -> String {
        let verb = match direction {
            Direction::Upload => "Uploaded",
            Direction::Download => "Downloaded",
        };
        format!(
            "{}: {}, Skipped: {}, Errors: {}",
            verb,
            self.files_transferred,
            self.files_skipped,
            self.files_errored + self.dirs_errored
        )
    }

    /// Convert a finished walk into the result reported for the host
    pub fn into_result(
        self,
        direction: Direction,
        elapsed: std::time::Duration,
    ) -> OperationResult {
        let error = match (self.files_errored, self.dirs_errored) {
            (0, 0) => None,
            (files, 0) => Some(format!("{} files failed", files)),
            (0, dirs) => Some(format!("{} directories could not be read", dirs)),
            (files, dirs) => Some(format!(
                "{} files failed, {} directories could not be read",
                files, dirs
            )),
        };
        OperationResult {
            success: error.is_none(),
            stdout: self.summary(direction),
            error,
            elapsed,
            sync: Some(self),
            ..Default::default()
        }
    }
}

impl std::ops::Add for SyncCounters {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        let mut skipped_by = self.skipped_by;
        for (reason, &count) in &other.skipped_by {
            skipped_by[reason] += count;
        }
        Self {
            files_transferred: self.files_transferred + other.files_transferred,
            files_skipped: self.files_skipped + other.files_skipped,
            files_errored: self.files_errored + other.files_errored,
            dirs_errored: self.dirs_errored + other.dirs_errored,
            skipped_by,
        }
    }
}

impl std::fmt::Display for SyncCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files transferred: {}\n\
            files skipped: {} (pattern: {}, size: {}, unchanged: {})\n\
            files errored: {}\n\
            directories errored: {}",
            self.files_transferred,
            self.files_skipped,
            self.skipped_by[SkipReason::Pattern],
            self.skipped_by[SkipReason::Size],
            self.skipped_by[SkipReason::Exists],
            self.files_errored,
            self.dirs_errored,
        )
    }
}

/// Remote path mirroring `relative` under `root`
fn remote_path_for(root: &str, relative: &std::path::Path) -> String {
    relative
        .components()
        .fold(root.to_string(), |path, component| {
            remote_join(&path, &component.as_os_str().to_string_lossy())
        })
}

/// Sorted (files, directories) of a local directory
///
/// Symlinks to directories are neither descended into nor synced, dangling symlinks are
/// reported as files so that their transfer fails and gets counted.
async fn read_local_dir(
    dir: &std::path::Path,
) -> anyhow::Result<(Vec<std::ffi::OsString>, Vec<std::ffi::OsString>)> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
    let mut files = vec![];
    let mut dirs = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", dir))?
    {
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("failed reading file type of {:?}", entry.path()))?;
        if file_type.is_dir() {
            dirs.push(entry.file_name());
        } else if file_type.is_symlink() {
            match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) if metadata.is_dir() => {
                    tracing::debug!("not following directory symlink {:?}", entry.path());
                }
                _ => files.push(entry.file_name()),
            }
        } else {
            files.push(entry.file_name());
        }
    }
    files.sort();
    dirs.sort();
    Ok((files, dirs))
}

pub struct DirectorySyncEngine<'a, C: FileChannel> {
    channel: &'a mut C,
    settings: &'a SyncSettings,
    counters: SyncCounters,
}

impl<'a, C: FileChannel> DirectorySyncEngine<'a, C> {
    pub fn new(channel: &'a mut C, settings: &'a SyncSettings) -> Self {
        Self {
            channel,
            settings,
            counters: SyncCounters::default(),
        }
    }

    fn report(&self, message: std::fmt::Arguments) {
        if self.settings.show_progress {
            tracing::info!("{}", message);
        } else {
            tracing::debug!("{}", message);
        }
    }

    fn matches_pattern(&self, relative: &std::path::Path) -> bool {
        self.settings
            .skip_pattern
            .as_ref()
            .is_some_and(|pattern| pattern.matches(relative))
    }

    /// Skip reasons that can be decided without looking at the destination
    fn local_skip_reason(&self, relative: &std::path::Path, size: u64) -> Option<SkipReason> {
        if self.matches_pattern(relative) {
            return Some(SkipReason::Pattern);
        }
        if self.settings.exceeds_size_limit(size) {
            return Some(SkipReason::Size);
        }
        None
    }

    fn record_skip(&mut self, reason: SkipReason, path: &dyn std::fmt::Debug) {
        match reason {
            SkipReason::Pattern => self.report(format_args!(
                "skipping {:?} (pattern: {})",
                path,
                self.settings
                    .skip_pattern
                    .as_ref()
                    .map(|p| p.original.as_str())
                    .unwrap_or_default()
            )),
            SkipReason::Size => self.report(format_args!(
                "skipping {:?} (size > {}MB)",
                path,
                self.settings.skip_size_mb.unwrap_or_default()
            )),
            SkipReason::Exists => {
                self.report(format_args!("skipping {:?} (already exists, same size)", path))
            }
        }
        self.counters.skip(reason);
    }

    fn record_dir_error(&mut self, error: &anyhow::Error) {
        tracing::error!("{:#}, skipping its contents", error);
        self.counters.dirs_errored += 1;
    }

    /// Create the local mirror of `remote_root` and list the remote entries
    async fn open_remote_dir(
        &mut self,
        remote_root: &str,
        local_root: &std::path::Path,
    ) -> anyhow::Result<Vec<crate::transport::RemoteEntry>> {
        tokio::fs::create_dir_all(local_root)
            .await
            .with_context(|| format!("failed creating local directory {:?}", local_root))?;
        self.channel
            .list_entries(remote_root)
            .await
            .with_context(|| format!("failed listing remote directory {}", remote_root))
    }

    /// Create `path` and every missing parent on the remote side
    ///
    /// Best effort: creation failures are logged and otherwise ignored, a missing directory
    /// will surface as failed transfers of the files inside it.
    async fn ensure_remote_dir(&mut self, path: &str) {
        let absolute = path.starts_with('/');
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            current = match (current.is_empty(), absolute) {
                (true, true) => format!("/{}", part),
                (true, false) => part.to_string(),
                (false, _) => remote_join(&current, part),
            };
            if let Ok(Some(_)) = self.channel.stat(&current).await {
                continue;
            }
            if let Err(error) = self.channel.mkdir(&current).await {
                tracing::debug!("mkdir {:?} failed (ignored): {:#}", current, error);
            }
        }
    }

    async fn put_file(
        &mut self,
        local_path: &std::path::Path,
        relative: &std::path::Path,
        remote_path: &str,
    ) {
        if self.matches_pattern(relative) {
            self.record_skip(SkipReason::Pattern, &local_path);
            return;
        }
        let size = match tokio::fs::metadata(local_path).await {
            Ok(metadata) => metadata.len(),
            Err(error) => {
                tracing::error!("failed reading metadata of {:?}: {}", local_path, error);
                self.counters.files_errored += 1;
                return;
            }
        };
        if self.settings.exceeds_size_limit(size) {
            self.record_skip(SkipReason::Size, &local_path);
            return;
        }
        if !self.settings.overwrite {
            // a failed stat is treated as "does not exist"
            let remote_size = self.channel.stat(remote_path).await.ok().flatten();
            if remote_size == Some(size) {
                self.record_skip(SkipReason::Exists, &local_path);
                return;
            }
        }
        self.report(format_args!("uploading {:?} -> {}", local_path, remote_path));
        match self.channel.put(local_path, remote_path).await {
            Ok(()) => self.counters.files_transferred += 1,
            Err(error) => {
                tracing::error!("error uploading {:?}: {:#}", local_path, error);
                self.counters.files_errored += 1;
            }
        }
    }

    /// Mirror `local_dir` into `remote_dir`
    #[instrument(skip(self))]
    pub async fn put_tree(
        mut self,
        local_dir: &std::path::Path,
        remote_dir: &str,
    ) -> anyhow::Result<SyncCounters> {
        let mut pending = vec![std::path::PathBuf::new()];
        while let Some(relative_dir) = pending.pop() {
            let local_root = local_dir.join(&relative_dir);
            let remote_root = remote_path_for(remote_dir, &relative_dir);
            self.ensure_remote_dir(&remote_root).await;
            let (files, dirs) = match read_local_dir(&local_root).await {
                Ok(listing) => listing,
                Err(error) if relative_dir.as_os_str().is_empty() => return Err(error),
                Err(error) => {
                    self.record_dir_error(&error);
                    continue;
                }
            };
            for name in files {
                let relative = relative_dir.join(&name);
                let remote_path = remote_join(&remote_root, &name.to_string_lossy());
                self.put_file(&local_root.join(&name), &relative, &remote_path)
                    .await;
            }
            // reversed so that the stack pops them in sorted order
            pending.extend(dirs.into_iter().rev().map(|name| relative_dir.join(name)));
        }
        tracing::debug!("put_tree done: {}", self.counters.summary(Direction::Upload));
        Ok(self.counters)
    }

    async fn get_file(
        &mut self,
        remote_path: &str,
        remote_size: u64,
        relative: &std::path::Path,
        local_path: &std::path::Path,
    ) {
        if let Some(reason) = self.local_skip_reason(relative, remote_size) {
            self.record_skip(reason, &remote_path);
            return;
        }
        if !self.settings.overwrite {
            let local_size = tokio::fs::metadata(local_path).await.map(|m| m.len()).ok();
            if local_size == Some(remote_size) {
                self.record_skip(SkipReason::Exists, &remote_path);
                return;
            }
        }
        self.report(format_args!("downloading {} -> {:?}", remote_path, local_path));
        match self.channel.get(remote_path, local_path).await {
            Ok(()) => self.counters.files_transferred += 1,
            Err(error) => {
                tracing::error!("error downloading {}: {:#}", remote_path, error);
                self.counters.files_errored += 1;
            }
        }
    }

    /// Mirror `remote_dir` into `local_dir`
    #[instrument(skip(self))]
    pub async fn get_tree(
        mut self,
        remote_dir: &str,
        local_dir: &std::path::Path,
    ) -> anyhow::Result<SyncCounters> {
        let mut pending = vec![std::path::PathBuf::new()];
        while let Some(relative_dir) = pending.pop() {
            let remote_root = remote_path_for(remote_dir, &relative_dir);
            let local_root = local_dir.join(&relative_dir);
            let mut entries = match self.open_remote_dir(&remote_root, &local_root).await {
                Ok(entries) => entries,
                Err(error) if relative_dir.as_os_str().is_empty() => return Err(error),
                Err(error) => {
                    self.record_dir_error(&error);
                    continue;
                }
            };
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            let mut dirs = vec![];
            for entry in entries {
                if entry.is_dir {
                    dirs.push(entry.name);
                    continue;
                }
                let remote_path = remote_join(&remote_root, &entry.name);
                self.get_file(
                    &remote_path,
                    entry.size,
                    &relative_dir.join(&entry.name),
                    &local_root.join(&entry.name),
                )
                .await;
            }
            pending.extend(dirs.into_iter().rev().map(|name| relative_dir.join(name)));
        }
        tracing::debug!("get_tree done: {}", self.counters.summary(Direction::Download));
        Ok(self.counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{MockFileChannel, MockTransport};
    use crate::transport::{Session, Transport};
    use tracing_test::traced_test;

    fn write(path: &std::path::Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    // src
    // |- 0.txt
    // |- big.bin     (3 bytes over 1 MiB)
    // |- notes.log
    // |- bar
    //    |- 1.txt
    //    |- 2.log
    // |- baz
    //    |- 3.txt
    fn setup_tree() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("0.txt"), "0");
        write(&src.join("notes.log"), "log");
        std::fs::write(src.join("big.bin"), vec![0u8; 1024 * 1024 + 3]).unwrap();
        write(&src.join("bar").join("1.txt"), "11");
        write(&src.join("bar").join("2.log"), "222");
        write(&src.join("baz").join("3.txt"), "3333");
        tmp
    }

    async fn channel(transport: &MockTransport) -> MockFileChannel {
        let host = crate::host::HostDescriptor::new("node", "user");
        let mut session = transport.connect(&host, None).await.unwrap();
        session.open_file_channel().await.unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn put_tree_mirrors_directory() -> anyhow::Result<()> {
        let tmp = setup_tree();
        let transport = MockTransport::new();
        let mut channel = channel(&transport).await;
        let settings = SyncSettings::default();
        let counters = DirectorySyncEngine::new(&mut channel, &settings)
            .put_tree(&tmp.path().join("src"), "/srv/app")
            .await?;
        assert_eq!(counters.files_transferred, 6);
        assert_eq!(counters.files_skipped, 0);
        assert_eq!(counters.files_errored, 0);
        let remote = transport.remote("node");
        let remote = remote.lock().unwrap();
        assert_eq!(remote.file("/srv/app/bar/1.txt").unwrap(), b"11");
        assert_eq!(remote.file("/srv/app/baz/3.txt").unwrap(), b"3333");
        assert!(remote.is_dir("/srv"));
        assert!(remote.is_dir("/srv/app/bar"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn skip_precedence_pattern_size_exists() -> anyhow::Result<()> {
        let tmp = setup_tree();
        let transport = MockTransport::new();
        {
            let remote = transport.remote("node");
            let mut remote = remote.lock().unwrap();
            // same size as local 0.txt, different size than local 3.txt
            remote.add_file("/dst/0.txt", b"x");
            remote.add_file("/dst/baz/3.txt", b"x");
        }
        let mut channel = channel(&transport).await;
        let settings = SyncSettings {
            skip_size_mb: Some(1.0),
            skip_pattern: Some(SkipPattern::parse("*.log")?),
            ..Default::default()
        };
        let counters = DirectorySyncEngine::new(&mut channel, &settings)
            .put_tree(&tmp.path().join("src"), "/dst")
            .await?;
        assert_eq!(counters.skipped_by[SkipReason::Pattern], 2);
        assert_eq!(counters.skipped_by[SkipReason::Size], 1);
        assert_eq!(counters.skipped_by[SkipReason::Exists], 1);
        assert_eq!(counters.files_skipped, 4);
        assert_eq!(counters.files_transferred, 2);
        assert_eq!(counters.files_visited(), 6);
        let remote = transport.remote("node");
        let remote = remote.lock().unwrap();
        assert!(remote.file("/dst/notes.log").is_none());
        assert!(remote.file("/dst/bar/2.log").is_none());
        assert!(remote.file("/dst/big.bin").is_none());
        assert_eq!(remote.file("/dst/0.txt").unwrap(), b"x");
        assert_eq!(remote.file("/dst/baz/3.txt").unwrap(), b"3333");
        assert!(logs_contain("pattern: *.log"));
        Ok(())
    }

    #[tokio::test]
    async fn overwrite_transfers_same_sized_files() -> anyhow::Result<()> {
        let tmp = setup_tree();
        let transport = MockTransport::new();
        let mut channel = channel(&transport).await;
        let settings = SyncSettings::default();
        DirectorySyncEngine::new(&mut channel, &settings)
            .put_tree(&tmp.path().join("src"), "/dst")
            .await?;
        let overwrite = SyncSettings {
            overwrite: true,
            ..Default::default()
        };
        let counters = DirectorySyncEngine::new(&mut channel, &overwrite)
            .put_tree(&tmp.path().join("src"), "/dst")
            .await?;
        assert_eq!(counters.files_transferred, 6);
        assert_eq!(counters.files_skipped, 0);
        Ok(())
    }

    #[tokio::test]
    async fn second_put_tree_transfers_nothing() -> anyhow::Result<()> {
        let tmp = setup_tree();
        let transport = MockTransport::new();
        let mut channel = channel(&transport).await;
        let settings = SyncSettings {
            show_progress: false,
            ..Default::default()
        };
        let first = DirectorySyncEngine::new(&mut channel, &settings)
            .put_tree(&tmp.path().join("src"), "/dst")
            .await?;
        assert_eq!(first.files_transferred, 6);
        let second = DirectorySyncEngine::new(&mut channel, &settings)
            .put_tree(&tmp.path().join("src"), "/dst")
            .await?;
        assert_eq!(second.files_transferred, 0);
        assert_eq!(second.skipped_by[SkipReason::Exists], 6);
        Ok(())
    }

    #[tokio::test]
    async fn failed_uploads_are_counted_not_fatal() -> anyhow::Result<()> {
        let tmp = setup_tree();
        let transport = MockTransport::new();
        transport
            .remote("node")
            .lock()
            .unwrap()
            .fail_transfer("/dst/bar/1.txt");
        let mut channel = channel(&transport).await;
        let settings = SyncSettings::default();
        let counters = DirectorySyncEngine::new(&mut channel, &settings)
            .put_tree(&tmp.path().join("src"), "/dst")
            .await?;
        assert_eq!(counters.files_errored, 1);
        assert_eq!(counters.files_transferred, 5);
        let result = counters.into_result(Direction::Upload, std::time::Duration::ZERO);
        assert!(!result.success);
        assert_eq!(result.stdout, "Uploaded: 5, Skipped: 0, Errors: 1");
        assert_eq!(result.error.as_deref(), Some("1 files failed"));
        Ok(())
    }

    /// Removes a local directory right after the first upload
    struct RemovingChannel {
        inner: MockFileChannel,
        remove: Option<std::path::PathBuf>,
    }

    impl FileChannel for RemovingChannel {
        async fn put(&mut self, local: &std::path::Path, remote: &str) -> anyhow::Result<()> {
            self.inner.put(local, remote).await?;
            if let Some(dir) = self.remove.take() {
                tokio::fs::remove_dir_all(dir).await?;
            }
            Ok(())
        }

        async fn get(&mut self, remote: &str, local: &std::path::Path) -> anyhow::Result<()> {
            self.inner.get(remote, local).await
        }

        async fn stat(&mut self, path: &str) -> anyhow::Result<Option<u64>> {
            self.inner.stat(path).await
        }

        async fn mkdir(&mut self, path: &str) -> anyhow::Result<()> {
            self.inner.mkdir(path).await
        }

        async fn list_entries(
            &mut self,
            path: &str,
        ) -> anyhow::Result<Vec<crate::transport::RemoteEntry>> {
            self.inner.list_entries(path).await
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn unreadable_subdirectory_is_counted_and_walk_continues() -> anyhow::Result<()> {
        let tmp = setup_tree();
        let src = tmp.path().join("src");
        let transport = MockTransport::new();
        let mut channel = RemovingChannel {
            inner: channel(&transport).await,
            remove: Some(src.join("bar")),
        };
        let settings = SyncSettings::default();
        let counters = DirectorySyncEngine::new(&mut channel, &settings)
            .put_tree(&src, "/dst")
            .await?;
        assert_eq!(counters.dirs_errored, 1);
        assert_eq!(counters.files_transferred, 4);
        assert_eq!(counters.files_errored, 0);
        {
            let remote = transport.remote("node");
            let remote = remote.lock().unwrap();
            assert_eq!(remote.file("/dst/baz/3.txt").unwrap(), b"3333");
            assert!(remote.file("/dst/bar/1.txt").is_none());
        }
        assert!(logs_contain("skipping its contents"));
        let result = counters.into_result(Direction::Upload, std::time::Duration::ZERO);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("1 directories could not be read"));
        assert_eq!(result.sync.unwrap().files_transferred, 4);
        Ok(())
    }

    #[tokio::test]
    async fn empty_directory_succeeds_with_zero_counters() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let transport = MockTransport::new();
        let mut channel = channel(&transport).await;
        let settings = SyncSettings::default();
        let counters = DirectorySyncEngine::new(&mut channel, &settings)
            .put_tree(tmp.path(), "/empty")
            .await?;
        assert_eq!(counters, SyncCounters::default());
        let result = counters.into_result(Direction::Upload, std::time::Duration::ZERO);
        assert!(result.success);
        assert!(result.error.is_none());
        assert!(transport.remote("node").lock().unwrap().is_dir("/empty"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_local_root_fails_the_walk() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let mut channel = channel(&transport).await;
        let settings = SyncSettings::default();
        let error = DirectorySyncEngine::new(&mut channel, &settings)
            .put_tree(&tmp.path().join("missing"), "/dst")
            .await
            .unwrap_err();
        assert!(format!("{error:#}").contains("cannot open directory"));
    }

    #[tokio::test]
    #[traced_test]
    async fn get_tree_mirrors_remote_directory() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let transport = MockTransport::new();
        {
            let remote = transport.remote("node");
            let mut remote = remote.lock().unwrap();
            remote.add_file("/data/a.txt", b"a");
            remote.add_file("/data/skip.tmp", b"tmp");
            remote.add_file("/data/sub/b.txt", b"bb");
            remote.add_file("/data/sub/deeper/c.txt", b"ccc");
        }
        let mut channel = channel(&transport).await;
        let local = tmp.path().join("out");
        // pre-existing local file with the same size is left alone
        write(&local.join("sub").join("b.txt"), "xx");
        let settings = SyncSettings {
            skip_pattern: Some(SkipPattern::parse("*.tmp")?),
            ..Default::default()
        };
        let counters = DirectorySyncEngine::new(&mut channel, &settings)
            .get_tree("/data", &local)
            .await?;
        assert_eq!(counters.files_transferred, 2);
        assert_eq!(counters.skipped_by[SkipReason::Pattern], 1);
        assert_eq!(counters.skipped_by[SkipReason::Exists], 1);
        assert_eq!(std::fs::read_to_string(local.join("a.txt"))?, "a");
        assert_eq!(std::fs::read_to_string(local.join("sub/b.txt"))?, "xx");
        assert_eq!(
            std::fs::read_to_string(local.join("sub/deeper/c.txt"))?,
            "ccc"
        );
        assert!(!local.join("skip.tmp").exists());
        assert_eq!(
            counters.into_result(Direction::Download, std::time::Duration::ZERO).stdout,
            "Downloaded: 2, Skipped: 2, Errors: 0"
        );
        Ok(())
    }

    #[tokio::test]
    async fn get_tree_skip_precedence_and_failed_downloads() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let transport = MockTransport::new();
        {
            let remote = transport.remote("node");
            let mut remote = remote.lock().unwrap();
            remote.add_file("/data/big.bin", &vec![0u8; 1024 * 1024 + 3]);
            // matches the pattern and exceeds the size limit, the pattern wins
            remote.add_file("/data/big.log", &vec![0u8; 1024 * 1024 + 3]);
            remote.add_file("/data/broken.txt", b"broken");
            remote.add_file("/data/notes.log", b"log");
            remote.add_file("/data/ok.txt", b"ok");
            remote.add_file("/data/same.txt", b"ab");
            remote.fail_transfer("/data/broken.txt");
        }
        let mut channel = channel(&transport).await;
        let local = tmp.path().join("out");
        write(&local.join("same.txt"), "xy");
        let settings = SyncSettings {
            skip_size_mb: Some(1.0),
            skip_pattern: Some(SkipPattern::parse("*.log")?),
            ..Default::default()
        };
        let counters = DirectorySyncEngine::new(&mut channel, &settings)
            .get_tree("/data", &local)
            .await?;
        assert_eq!(counters.skipped_by[SkipReason::Pattern], 2);
        assert_eq!(counters.skipped_by[SkipReason::Size], 1);
        assert_eq!(counters.skipped_by[SkipReason::Exists], 1);
        assert_eq!(counters.files_errored, 1);
        assert_eq!(counters.files_transferred, 1);
        assert_eq!(counters.files_visited(), 6);
        assert_eq!(std::fs::read_to_string(local.join("ok.txt"))?, "ok");
        assert_eq!(std::fs::read_to_string(local.join("same.txt"))?, "xy");
        assert!(!local.join("big.bin").exists());
        let result = counters.into_result(Direction::Download, std::time::Duration::ZERO);
        assert!(!result.success);
        assert_eq!(result.stdout, "Downloaded: 1, Skipped: 4, Errors: 1");

        let overwrite = SyncSettings {
            overwrite: true,
            ..settings
        };
        let counters = DirectorySyncEngine::new(&mut channel, &overwrite)
            .get_tree("/data", &local)
            .await?;
        assert_eq!(counters.skipped_by[SkipReason::Exists], 0);
        assert_eq!(counters.files_transferred, 2);
        assert_eq!(counters.files_errored, 1);
        assert_eq!(std::fs::read_to_string(local.join("same.txt"))?, "ab");
        Ok(())
    }

    #[tokio::test]
    async fn get_tree_continues_past_unlistable_subdirectory() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let transport = MockTransport::new();
        {
            let remote = transport.remote("node");
            let mut remote = remote.lock().unwrap();
            remote.add_file("/data/a.txt", b"a");
            remote.add_file("/data/locked/secret.txt", b"s");
            remote.add_file("/data/open/b.txt", b"b");
            remote.fail_listing("/data/locked");
        }
        let mut channel = channel(&transport).await;
        let local = tmp.path().join("out");
        let settings = SyncSettings::default();
        let counters = DirectorySyncEngine::new(&mut channel, &settings)
            .get_tree("/data", &local)
            .await?;
        assert_eq!(counters.files_transferred, 2);
        assert_eq!(counters.dirs_errored, 1);
        assert_eq!(std::fs::read_to_string(local.join("open/b.txt"))?, "b");
        assert!(!local.join("locked/secret.txt").exists());
        let result = counters.into_result(Direction::Download, std::time::Duration::ZERO);
        assert!(!result.success);
        assert_eq!(result.stdout, "Downloaded: 2, Skipped: 0, Errors: 1");
        Ok(())
    }

    #[tokio::test]
    async fn get_tree_of_missing_remote_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let mut channel = channel(&transport).await;
        let settings = SyncSettings::default();
        let error = DirectorySyncEngine::new(&mut channel, &settings)
            .get_tree("/nope", tmp.path())
            .await
            .unwrap_err();
        assert!(format!("{error:#}").contains("failed listing remote directory /nope"));
    }

    #[test]
    fn counters_add_up() {
        let mut a = SyncCounters::default();
        a.files_transferred = 2;
        a.skip(SkipReason::Size);
        let mut b = SyncCounters::default();
        b.files_errored = 1;
        b.skip(SkipReason::Size);
        b.skip(SkipReason::Pattern);
        let sum = a + b;
        assert_eq!(sum.files_visited(), 6);
        assert_eq!(sum.skipped_by[SkipReason::Size], 2);
        assert_eq!(sum.skipped_by[SkipReason::Pattern], 1);
    }

    #[test]
    fn remote_paths_mirror_relative_dirs() {
        assert_eq!(remote_path_for("/r", std::path::Path::new("")), "/r");
        assert_eq!(remote_path_for("/r/", std::path::Path::new("a/b")), "/r/a/b");
    }
}
