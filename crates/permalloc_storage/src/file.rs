//! Filesystem helpers shared by the segment and the manager.
//!
//! Every helper returns a [`StorageResult`]; none of them panic on
//! environmental failures (missing files, full disks, permissions).

use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, warn};

/// Buffer size used when copying data ranges by hand.
const COPY_BUFFER_SIZE: usize = 1 << 20;

/// Suffix of the temporary file used by [`write_file_atomic`].
const TEMP_SUFFIX: &str = ".tmp";

/// How a file is duplicated by the copy helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Byte-for-byte copy; holes are materialized.
    Dense,
    /// Copy only the data regions, preserving holes where supported.
    Sparse,
    /// Reflink clone where the filesystem supports it, else a sparse copy.
    Clone,
}

/// Creates a new, empty file. Fails if the file already exists.
///
/// The parent directory is synced so the new entry survives a crash.
pub fn create_file(path: &Path) -> StorageResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
                path: path.to_path_buf(),
            },
            _ => StorageError::Io(e),
        })?;
    sync_parent_directory(path)?;
    Ok(file)
}

/// Grows `file` to at least `size` bytes.
///
/// With `zero_fill` the blocks are allocated up front; otherwise the file is
/// extended sparsely with `set_len`. A file that is already large enough is
/// left untouched.
pub fn extend_file_size(file: &File, size: u64, zero_fill: bool) -> StorageResult<()> {
    if zero_fill {
        file.allocate(size)?;
    } else if file.metadata()?.len() < size {
        file.set_len(size)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Flushes a file or directory to durable storage.
pub fn fsync(path: &Path) -> StorageResult<()> {
    let file = File::open(path).map_err(|e| not_found_or_io(e, path))?;
    file.sync_all()?;
    Ok(())
}

/// Syncs a directory so that created, renamed or removed entries are durable.
#[cfg(unix)]
pub fn sync_directory(path: &Path) -> StorageResult<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

/// Syncs a directory so that created, renamed or removed entries are durable.
#[cfg(not(unix))]
pub fn sync_directory(_path: &Path) -> StorageResult<()> {
    Ok(())
}

fn sync_parent_directory(path: &Path) -> StorageResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_directory(parent),
        _ => Ok(()),
    }
}

/// Returns true if `path` names an existing regular file.
#[must_use]
pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

/// Returns true if `path` names an existing directory.
#[must_use]
pub fn directory_exists(path: &Path) -> bool {
    path.is_dir()
}

/// Reads a whole file.
pub fn read_file(path: &Path) -> StorageResult<Vec<u8>> {
    fs::read(path).map_err(|e| not_found_or_io(e, path))
}

/// Replaces `path` with `data` atomically.
///
/// 1. Write to `<path>.tmp`
/// 2. Sync the temporary file
/// 3. Rename it over `path`
/// 4. Sync the parent directory so the rename is durable
pub fn write_file_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let temp_path = temp_path_for(path);

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    sync_parent_directory(path)?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Removes a file or a whole directory tree.
///
/// Returns `false` if nothing existed at `path`.
pub fn remove_path(path: &Path) -> StorageResult<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    sync_parent_directory(path)?;
    Ok(true)
}

/// Releases the disk blocks backing `[offset, offset + len)` of `file`
/// without changing its size.
///
/// Returns `false` if the platform or filesystem cannot punch holes. Failure
/// is never fatal: the range simply keeps its blocks.
#[cfg(target_os = "linux")]
pub fn free_file_space(file: &File, offset: u64, len: u64) -> bool {
    use std::os::unix::io::AsRawFd;

    let (Ok(off), Ok(length)) = (libc::off_t::try_from(offset), libc::off_t::try_from(len)) else {
        return false;
    };
    // SAFETY: fallocate only reads the descriptor and integer arguments; the
    // descriptor is valid for the lifetime of `file`.
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            off,
            length,
        )
    };
    if rc == -1 {
        warn!(
            error = %io::Error::last_os_error(),
            offset, len, "failed to punch hole"
        );
        return false;
    }
    true
}

/// Releases the disk blocks backing a range of `file`.
///
/// Hole punching is not supported on this platform; always returns `false`.
#[cfg(not(target_os = "linux"))]
pub fn free_file_space(_file: &File, _offset: u64, _len: u64) -> bool {
    false
}

/// Copies `source` to `destination`, overwriting it.
///
/// With `sparse` set, only data regions are copied and holes are preserved.
/// If sparse copying is unavailable the copy silently falls back to a dense
/// one.
pub fn copy_file(source: &Path, destination: &Path, sparse: bool) -> StorageResult<()> {
    if sparse {
        match copy_file_sparse(source, destination) {
            Ok(()) => return Ok(()),
            Err(e) => warn!(
                error = %e,
                source = %source.display(),
                "sparse copy failed, falling back to dense copy"
            ),
        }
    }
    copy_file_dense(source, destination)
}

fn copy_file_dense(source: &Path, destination: &Path) -> StorageResult<()> {
    fs::copy(source, destination).map_err(|e| not_found_or_io(e, source))?;
    fsync(destination)
}

#[cfg(target_os = "linux")]
fn copy_file_sparse(source: &Path, destination: &Path) -> StorageResult<()> {
    use std::os::unix::io::AsRawFd;

    let src = File::open(source).map_err(|e| not_found_or_io(e, source))?;
    let metadata = src.metadata()?;
    let len = metadata.len();
    let dst = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(destination)?;
    dst.set_permissions(metadata.permissions())?;

    let fd = src.as_raw_fd();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut offset: libc::off_t = 0;

    while (offset as u64) < len {
        // SAFETY: lseek only repositions the descriptor owned by `src`.
        let data_start = unsafe { libc::lseek(fd, offset, libc::SEEK_DATA) };
        if data_start < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENXIO) {
                break; // no data past `offset`
            }
            return Err(err.into());
        }
        // SAFETY: as above.
        let hole_start = unsafe { libc::lseek(fd, data_start, libc::SEEK_HOLE) };
        if hole_start < 0 {
            return Err(io::Error::last_os_error().into());
        }

        copy_range(
            &src,
            &dst,
            data_start as u64,
            (hole_start - data_start) as u64,
            &mut buffer,
        )?;
        offset = hole_start;
    }

    dst.set_len(len)?;
    dst.sync_all()?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn copy_file_sparse(_source: &Path, _destination: &Path) -> StorageResult<()> {
    Err(StorageError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        "sparse copy is only supported on linux",
    )))
}

#[cfg(unix)]
fn copy_range(src: &File, dst: &File, start: u64, len: u64, buffer: &mut [u8]) -> StorageResult<()> {
    use std::os::unix::fs::FileExt;

    let mut copied = 0u64;
    while copied < len {
        let step = buffer.len().min((len - copied) as usize);
        let chunk = &mut buffer[..step];
        src.read_exact_at(chunk, start + copied)?;
        dst.write_all_at(chunk, start + copied)?;
        copied += step as u64;
    }
    Ok(())
}

/// Clones `source` to `destination` using a copy-on-write reflink.
///
/// Falls back to [`copy_file`] (sparse) when the filesystem cannot clone.
#[cfg(target_os = "linux")]
pub fn clone_file(source: &Path, destination: &Path) -> StorageResult<()> {
    use std::os::unix::io::AsRawFd;

    /// `_IOW(0x94, 9, int)`
    const FICLONE: u64 = 0x4004_9409;

    let src = File::open(source).map_err(|e| not_found_or_io(e, source))?;
    let dst = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(destination)?;

    // SAFETY: both descriptors are valid for the duration of the call and the
    // ioctl takes the source descriptor by value.
    let rc = unsafe { libc::ioctl(dst.as_raw_fd(), FICLONE as _, src.as_raw_fd()) };
    if rc == 0 {
        dst.sync_all()?;
        return Ok(());
    }

    debug!(
        error = %io::Error::last_os_error(),
        source = %source.display(),
        "reflink unsupported, copying instead"
    );
    drop(dst);
    copy_file(source, destination, true)
}

/// Clones `source` to `destination`.
///
/// Reflinks are not available on this platform; performs a regular copy.
#[cfg(not(target_os = "linux"))]
pub fn clone_file(source: &Path, destination: &Path) -> StorageResult<()> {
    copy_file(source, destination, true)
}

/// Lists the names of the regular files directly inside `dir`, sorted.
pub fn regular_file_names(dir: &Path) -> StorageResult<Vec<String>> {
    if !directory_exists(dir) {
        return Err(StorageError::NotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Copies every `(source, destination)` pair using a bounded worker pool.
///
/// `max_threads == 0` uses the available hardware parallelism. A failing file
/// does not stop the others; the call reports [`StorageError::CopyFailed`]
/// once every worker has finished.
pub fn copy_files_in_parallel(
    pairs: &[(PathBuf, PathBuf)],
    max_threads: usize,
    mode: CopyMode,
) -> StorageResult<()> {
    if pairs.is_empty() {
        return Ok(());
    }

    let workers = worker_count(max_threads).min(pairs.len());
    let next = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                let Some((source, destination)) = pairs.get(index) else {
                    break;
                };
                let result = match mode {
                    CopyMode::Dense => copy_file(source, destination, false),
                    CopyMode::Sparse => copy_file(source, destination, true),
                    CopyMode::Clone => clone_file(source, destination),
                };
                if let Err(e) = result {
                    error!(
                        error = %e,
                        source = %source.display(),
                        destination = %destination.display(),
                        "failed to copy file"
                    );
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    match failed.into_inner() {
        0 => Ok(()),
        failed => Err(StorageError::CopyFailed {
            failed,
            total: pairs.len(),
        }),
    }
}

/// Copies the regular files of `source_dir` into `destination_dir` in parallel.
///
/// Subdirectories are not copied. `destination_dir` is created if missing.
/// Returns the number of files copied.
pub fn copy_files_in_directory_in_parallel(
    source_dir: &Path,
    destination_dir: &Path,
    max_threads: usize,
    mode: CopyMode,
) -> StorageResult<usize> {
    let names = regular_file_names(source_dir)?;
    fs::create_dir_all(destination_dir)?;

    let pairs: Vec<_> = names
        .iter()
        .map(|name| (source_dir.join(name), destination_dir.join(name)))
        .collect();
    copy_files_in_parallel(&pairs, max_threads, mode)?;
    sync_directory(destination_dir)?;
    Ok(pairs.len())
}

fn worker_count(max_threads: usize) -> usize {
    if max_threads > 0 {
        max_threads
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

fn not_found_or_io(e: io::Error, path: &Path) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        StorageError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_file_refuses_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunk");

        create_file(&path).unwrap();
        let result = create_file(&path);
        assert!(matches!(result, Err(StorageError::AlreadyExists { .. })));
    }

    #[test]
    fn extend_grows_but_never_shrinks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunk");
        let file = create_file(&path).unwrap();

        extend_file_size(&file, 8192, false).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 8192);

        extend_file_size(&file, 4096, false).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 8192);

        extend_file_size(&file, 16384, true).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 16384);
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("directory");

        write_file_atomic(&path, b"first").unwrap();
        write_file_atomic(&path, b"second").unwrap();

        assert_eq!(read_file(&path).unwrap(), b"second");
        assert!(!dir.path().join("directory.tmp").exists());
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let result = read_file(&dir.path().join("missing"));
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn remove_path_handles_trees_and_absence() {
        let dir = tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("nested")).unwrap();
        fs::write(tree.join("nested").join("file"), b"x").unwrap();

        assert!(remove_path(&tree).unwrap());
        assert!(!tree.exists());
        assert!(!remove_path(&tree).unwrap());
    }

    #[test]
    fn sparse_copy_preserves_content_and_size() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let destination = dir.path().join("destination");

        let file = create_file(&source).unwrap();
        extend_file_size(&file, 4 << 20, false).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            file.write_all_at(b"head", 0).unwrap();
            file.write_all_at(b"tail", (4 << 20) - 4).unwrap();
        }
        drop(file);

        copy_file(&source, &destination, true).unwrap();

        let copied = fs::read(&destination).unwrap();
        assert_eq!(copied.len(), 4 << 20);
        assert_eq!(copied, fs::read(&source).unwrap());
    }

    #[test]
    fn clone_file_produces_identical_copy() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let destination = dir.path().join("destination");
        fs::write(&source, b"clone me").unwrap();

        clone_file(&source, &destination).unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"clone me");
    }

    #[test]
    fn parallel_copy_copies_every_file() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("src");
        let destination = dir.path().join("dst");
        fs::create_dir_all(&source).unwrap();
        for i in 0..8 {
            fs::write(source.join(format!("file_{i}")), vec![i as u8; 1000]).unwrap();
        }
        fs::create_dir_all(source.join("subdir")).unwrap();

        let copied =
            copy_files_in_directory_in_parallel(&source, &destination, 3, CopyMode::Sparse)
                .unwrap();
        assert_eq!(copied, 8);
        for i in 0..8 {
            let data = fs::read(destination.join(format!("file_{i}"))).unwrap();
            assert_eq!(data, vec![i as u8; 1000]);
        }
        assert!(!destination.join("subdir").exists());
    }

    #[test]
    fn parallel_copy_reports_failures_after_finishing_others() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good");
        fs::write(&good, b"ok").unwrap();

        let pairs = vec![
            (good.clone(), dir.path().join("good_copy")),
            (dir.path().join("missing"), dir.path().join("missing_copy")),
        ];
        let result = copy_files_in_parallel(&pairs, 2, CopyMode::Dense);

        assert!(matches!(
            result,
            Err(StorageError::CopyFailed {
                failed: 1,
                total: 2
            })
        ));
        assert_eq!(fs::read(dir.path().join("good_copy")).unwrap(), b"ok");
    }

    #[test]
    fn regular_file_names_are_sorted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b"), b"").unwrap();
        fs::write(dir.path().join("a"), b"").unwrap();

        assert_eq!(regular_file_names(dir.path()).unwrap(), vec!["a", "b"]);
    }
}
