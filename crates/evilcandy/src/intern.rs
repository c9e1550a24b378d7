//! String and bytes interning.
//!
//! Every string literal, identifier, dict key name, and attribute name that
//! the assembler sees is interned once per interpreter and referenced by a
//! compact [`StringId`]. Interned strings are immutable and live as long as
//! the interpreter, so equal ids always mean equal (and pointer-identical)
//! text. Bytes literals get the same treatment with [`BytesId`].
//!
//! Dynamic strings produced at runtime (concatenation, slicing) are *not*
//! interned; they live on the heap as ordinary refcounted values.

use ahash::AHashMap;

use crate::types::str::EcStr;

/// Index into the string interner's storage.
///
/// `u32` keeps `Value` small; four billion distinct literals is plenty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StringId(u32);

impl StringId {
    /// Reconstructs an id from a rodata operand.
    ///
    /// The caller is responsible for the index having come from this
    /// interpreter's interner.
    #[inline]
    #[must_use]
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index into the bytes interner's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BytesId(u32);

impl BytesId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-interpreter intern tables for strings and bytes.
///
/// Owned by the interpreter state, threaded by reference everywhere the
/// text of a literal is needed (symbol resolution, error messages, dict
/// keys, the serializer).
#[derive(Debug, Default)]
pub struct Interns {
    strings: Vec<EcStr>,
    string_ids: AHashMap<Box<str>, StringId>,
    bytes: Vec<Box<[u8]>>,
    bytes_ids: AHashMap<Box<[u8]>, BytesId>,
}

impl Interns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning the existing id when the text was seen
    /// before.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("string intern table exceeds u32"));
        self.strings.push(EcStr::new(s.to_owned()));
        self.string_ids.insert(Box::from(s), id);
        id
    }

    /// Returns the interned text for an id.
    ///
    /// # Panics
    /// Panics if the id did not come from this interner.
    #[must_use]
    pub fn get_str(&self, id: StringId) -> &str {
        self.strings[id.index()].as_str()
    }

    /// Returns the full string record (cached lengths, hash, ASCII flag).
    #[must_use]
    pub fn get(&self, id: StringId) -> &EcStr {
        &self.strings[id.index()]
    }

    /// Looks up an already-interned string without inserting.
    #[must_use]
    pub fn lookup(&self, s: &str) -> Option<StringId> {
        self.string_ids.get(s).copied()
    }

    /// Interns a bytes literal.
    pub fn intern_bytes(&mut self, b: &[u8]) -> BytesId {
        if let Some(&id) = self.bytes_ids.get(b) {
            return id;
        }
        let id = BytesId(u32::try_from(self.bytes.len()).expect("bytes intern table exceeds u32"));
        self.bytes.push(Box::from(b));
        self.bytes_ids.insert(Box::from(b), id);
        id
    }

    /// Returns the interned bytes for an id.
    ///
    /// # Panics
    /// Panics if the id did not come from this interner.
    #[must_use]
    pub fn get_bytes(&self, id: BytesId) -> &[u8] {
        &self.bytes[id.index()]
    }

    /// Number of interned strings. Used by tests and diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_dedups() {
        let mut interns = Interns::new();
        let a = interns.intern("foreach");
        let b = interns.intern("foreach");
        let c = interns.intern("append");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interns.get_str(a), "foreach");
        assert_eq!(interns.len(), 2);
    }

    #[test]
    fn interned_string_caches_metadata() {
        let mut interns = Interns::new();
        let id = interns.intern("héllo");
        let rec = interns.get(id);
        assert_eq!(rec.char_len(), 5);
        assert_eq!(rec.byte_len(), 6);
        assert!(!rec.is_ascii());
    }

    #[test]
    fn bytes_intern_dedups() {
        let mut interns = Interns::new();
        let a = interns.intern_bytes(b"\x00\x01");
        let b = interns.intern_bytes(b"\x00\x01");
        assert_eq!(a, b);
        assert_eq!(interns.get_bytes(a), b"\x00\x01");
    }
}
