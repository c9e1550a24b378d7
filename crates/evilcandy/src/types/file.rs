//! File payload: a wrapped OS resource with an idempotent destructor.

use std::io::{Read, Write};

use crate::exc::{RunError, RunResult};

/// A file handle. Closing drops the underlying handle and parks the
/// descriptor at -1 so a second close (or the destructor after an explicit
/// close) is a no-op.
#[derive(Debug)]
pub struct File {
    inner: Option<std::fs::File>,
    fd: i32,
    path: String,
}

impl File {
    #[must_use]
    pub fn new(file: std::fs::File, path: String) -> Self {
        #[cfg(unix)]
        let fd = {
            use std::os::unix::io::AsRawFd;
            file.as_raw_fd()
        };
        #[cfg(not(unix))]
        let fd = 0;
        Self {
            inner: Some(file),
            fd,
            path,
        }
    }

    /// The descriptor, or -1 once closed.
    #[must_use]
    pub fn fd(&self) -> i32 {
        self.fd
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    pub fn close(&mut self) {
        self.inner = None;
        self.fd = -1;
    }

    pub fn read_to_string(&mut self) -> RunResult<String> {
        let Some(file) = self.inner.as_mut() else {
            return Err(RunError::system(format!("file '{}' is closed", self.path)));
        };
        let mut out = String::new();
        file.read_to_string(&mut out)
            .map_err(|e| RunError::system(format!("read '{}': {e}", self.path)))?;
        Ok(out)
    }

    pub fn write_all(&mut self, data: &[u8]) -> RunResult<()> {
        let Some(file) = self.inner.as_mut() else {
            return Err(RunError::system(format!("file '{}' is closed", self.path)));
        };
        file.write_all(data)
            .map_err(|e| RunError::system(format!("write '{}': {e}", self.path)))
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // close() may already have run; both paths are no-ops then.
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent() {
        let tmp = std::env::temp_dir().join("evilcandy-file-test.txt");
        std::fs::write(&tmp, b"hi").unwrap();
        let mut f = File::new(std::fs::File::open(&tmp).unwrap(), tmp.display().to_string());
        assert!(f.fd() >= 0 || cfg!(not(unix)));
        f.close();
        assert_eq!(f.fd(), -1);
        assert!(f.is_closed());
        f.close();
        assert_eq!(f.fd(), -1);
        assert!(f.read_to_string().is_err());
        let _ = std::fs::remove_file(&tmp);
    }
}
