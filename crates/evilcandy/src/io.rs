//! Output plumbing for the `print` builtin.
//!
//! The interpreter writes through a [`PrintWriter`] trait object, so
//! embedders and tests capture script output without touching process
//! stdout.

use std::{
    cell::RefCell,
    io::Write,
    rc::Rc,
};

/// Sink for `print` output.
pub trait PrintWriter {
    /// Writes one already-formatted chunk (no separators added here).
    fn write_str(&mut self, s: &str);

    /// Writes the separator or terminator character between chunks.
    fn push_char(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.write_str(c.encode_utf8(&mut buf));
    }
}

/// Default writer: process stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write_str(&mut self, s: &str) {
        let mut out = std::io::stdout().lock();
        // A broken stdout pipe is not a script error.
        let _ = out.write_all(s.as_bytes());
    }
}

/// Writer that collects output into a shared string, for tests and
/// embedding.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    buf: Rc<RefCell<String>>,
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that observes everything written, independent of the
    /// interpreter owning the writer.
    #[must_use]
    pub fn handle(&self) -> Rc<RefCell<String>> {
        Rc::clone(&self.buf)
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_str(&mut self, s: &str) {
        self.buf.borrow_mut().push_str(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_shares_buffer() {
        let mut w = CollectStringPrint::new();
        let handle = w.handle();
        w.write_str("hi");
        w.push_char('\n');
        assert_eq!(&*handle.borrow(), "hi\n");
    }
}
