// Portable target layer. The orchestrator drives everything through this
// trait so that platform path translation, raw-device access and
// privilege handling stay outside the core. Device-only operations carry
// no-op defaults, which is what file-backed containers want.

use std::fs::{File, FileTimes, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::SystemTime;

pub struct OpenRequest {
    // Create (truncating any existing file) instead of opening an
    // existing container. Hidden-volume and retry opens never create.
    pub create: bool,
    // Allow other readers/writers while the handle is open.
    pub shared: bool,
}

pub trait Target: Send {
    fn open(&mut self, req: &OpenRequest) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
    fn seek(&mut self, offset: u64) -> io::Result<()>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    fn preallocate(&mut self, size: u64) -> io::Result<()>;
    fn truncate_to_zero(&mut self) -> io::Result<()>;

    fn set_sparse(&mut self) -> io::Result<()> {
        Ok(())
    }

    // Marks the preallocated range as valid without zero-filling it.
    // Security-sensitive: prior disk contents become readable through the
    // container file until overwritten. Callers gate this behind an
    // explicit opt-in.
    fn set_valid_data_length(&mut self, _size: u64) -> io::Result<()> {
        Ok(())
    }

    fn is_device(&self) -> bool {
        false
    }

    fn is_mounted(&self) -> bool {
        false
    }

    fn dismount(&mut self) -> io::Result<()> {
        Ok(())
    }

    // Request raw sector access past the filesystem driver. Returns false
    // when the platform denies it; the orchestrator then falls back to a
    // pseudo quick-format cycle.
    fn allow_extended_dasd(&mut self) -> bool {
        true
    }

    fn capture_timestamps(&mut self) {}

    fn restore_timestamps(&mut self) {}
}

// File-backed container on the local filesystem.
pub struct FileTarget {
    path: PathBuf,
    file: Option<File>,
    timestamps: Option<(SystemTime, SystemTime)>,
}

impl FileTarget {
    pub fn new(path: impl Into<PathBuf>) -> FileTarget {
        FileTarget {
            path: path.into(),
            file: None,
            timestamps: None,
        }
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "container not open"))
    }
}

impl Target for FileTarget {
    fn open(&mut self, req: &OpenRequest) -> io::Result<()> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if req.create {
            options.create(true).truncate(true);
        }
        // POSIX has no share modes; `shared` only matters for device
        // implementations.
        self.file = Some(options.open(&self.path)?);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.file_mut()?.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file_mut()?.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(f) => {
                f.flush()?;
                f.sync_all()
            }
            None => Ok(()),
        }
    }

    fn preallocate(&mut self, size: u64) -> io::Result<()> {
        self.file_mut()?.set_len(size)
    }

    fn truncate_to_zero(&mut self) -> io::Result<()> {
        let f = self.file_mut()?;
        f.set_len(0)?;
        f.seek(SeekFrom::Start(0)).map(|_| ())
    }

    fn capture_timestamps(&mut self) {
        self.timestamps = std::fs::metadata(&self.path)
            .and_then(|m| Ok((m.accessed()?, m.modified()?)))
            .ok();
    }

    fn restore_timestamps(&mut self) {
        if let (Some(f), Some((accessed, modified))) = (&self.file, self.timestamps) {
            let times = FileTimes::new().set_accessed(accessed).set_modified(modified);
            if let Err(e) = f.set_times(times) {
                log::warn!("could not restore container timestamps: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(name);
        p
    }

    #[test]
    fn create_write_truncate_cycle() {
        let path = scratch("volformat_device_cycle.bin");
        let _ = std::fs::remove_file(&path);

        let mut t = FileTarget::new(&path);
        t.open(&OpenRequest { create: true, shared: false }).unwrap();
        t.preallocate(4096).unwrap();
        t.seek(0).unwrap();
        t.write_all(&[0xabu8; 512]).unwrap();
        t.flush().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);

        t.truncate_to_zero().unwrap();
        t.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        // closing twice is fine
        t.close().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn writes_after_close_are_rejected() {
        let mut t = FileTarget::new(scratch("volformat_device_closed.bin"));
        assert!(t.write_all(&[0u8; 16]).is_err());
        assert!(t.seek(0).is_err());
    }
}
