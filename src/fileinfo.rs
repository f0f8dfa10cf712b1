//! File stat fingerprints and the filesystem interface consumed by the build
//! system.

use std::sync::Arc;

/// A compact stat fingerprint for a file, with exact equality semantics.
/// This also models "file is absent" via the all-zero sentinel, which keeps
/// the serialized form fixed-size.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub device: u64,
    pub inode: u64,
    pub mode: u64,
    pub size: u64,
    pub mtime: u64,
    pub mtime_nsec: u64,
}

impl FileInfo {
    pub fn missing() -> FileInfo {
        FileInfo::default()
    }

    pub fn is_missing(&self) -> bool {
        *self == FileInfo::default()
    }

    #[cfg(unix)]
    pub fn is_directory(&self) -> bool {
        (self.mode as libc::mode_t) & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        for field in [
            self.device,
            self.inode,
            self.mode,
            self.size,
            self.mtime,
            self.mtime_nsec,
        ] {
            buf.extend_from_slice(&field.to_le_bytes());
        }
    }

    pub fn decode(buf: &[u8]) -> Option<(FileInfo, &[u8])> {
        if buf.len() < 48 {
            return None;
        }
        let mut fields = [0u64; 6];
        for (i, field) in fields.iter_mut().enumerate() {
            *field = u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().ok()?);
        }
        let info = FileInfo {
            device: fields[0],
            inode: fields[1],
            mode: fields[2],
            size: fields[3],
            mtime: fields[4],
            mtime_nsec: fields[5],
        };
        Some((info, &buf[48..]))
    }
}

/// Filesystem operations used by the build core.  Indirected so tests and
/// hosts can substitute their own view of the disk.
pub trait FileSystem: Send + Sync {
    /// stat() a path; a missing file is the FileInfo::missing() sentinel.
    fn file_info(&self, path: &str) -> FileInfo;

    fn file_contents(&self, path: &str) -> std::io::Result<Vec<u8>>;

    fn create_directories(&self, path: &str) -> std::io::Result<()>;
}

pub struct RealFileSystem;

#[cfg(unix)]
impl FileSystem for RealFileSystem {
    fn file_info(&self, path: &str) -> FileInfo {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(meta) => FileInfo {
                device: meta.dev(),
                inode: meta.ino(),
                mode: meta.mode() as u64,
                size: meta.size(),
                mtime: meta.mtime() as u64,
                mtime_nsec: meta.mtime_nsec() as u64,
            },
            Err(_) => FileInfo::missing(),
        }
    }

    fn file_contents(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn create_directories(&self, path: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(path)
    }
}

pub fn real_file_system() -> Arc<dyn FileSystem> {
    Arc::new(RealFileSystem)
}
