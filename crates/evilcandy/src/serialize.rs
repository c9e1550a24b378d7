//! Byte-code file serialization.
//!
//! The on-disk format is big-endian throughout:
//!
//! ```text
//! Header: magic "EVC\0" (4B), xptr_count (4B), version (2B), filename (string)
//! For each executable:
//!     'X' (1B), file_line (4B), uuid (string)
//!     'I' (1B), n_instr (4B), instr[..] (4B each: code, arg1, arg2)
//!     'R' (1B), n_rodata (4B), { tag (1B) ; payload }[..]
//!     'L' (1B), n_label (4B), u16[..]
//! Footer: 'F' (1B), checksum (2B)
//! string := length (4B, includes NUL) ; bytes ; NUL
//! ```
//!
//! The checksum is the RFC-1071 16-bit ones'-complement sum over the whole
//! file with the checksum bytes zeroed (a synthetic zero byte pads odd
//! lengths); on read, summing the file including the stored checksum must
//! produce the ones'-complement zero.
//!
//! In memory executables reference each other by `Rc`; on disk, by uuid.
//! Reading is two-phase: all records are materialized first, then
//! uuid references are patched into `Rc` edges. Unresolved or circular
//! references are errors.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    code::Instr,
    exc::{RunError, RunResult},
    intern::Interns,
    xptr::{Rodata, Xptr},
};

const HEADER_MAGIC: u32 = 0x4556_4300; // big-endian "EVC\0"
const EXEC_MAGIC: u8 = b'X';
const INSTR_MAGIC: u8 = b'I';
const RODATA_MAGIC: u8 = b'R';
const LABEL_MAGIC: u8 = b'L';
const FOOTER_MAGIC: u8 = b'F';

const SERIAL_VERSION: u16 = 1;

// Rodata tags.
const TYPE_EMPTY: u8 = 0;
const TYPE_FLOAT: u8 = 1;
const TYPE_INT: u8 = 2;
const TYPE_STRPTR: u8 = 3;
const TYPE_XPTR: u8 = 4;
const TYPE_BYTES: u8 = 5;

/// 16-bit ones'-complement sum with end-around carry, padding odd lengths
/// with a zero byte.
#[must_use]
pub fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
        while sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }
    sum as u16
}

fn bad_checksum() -> RunError {
    RunError::runtime("byte code file bad checksum")
}

fn truncated() -> RunError {
    RunError::runtime("byte code file truncated")
}

// ----------------------------------------------------------------------
// Writing
// ----------------------------------------------------------------------

/// Serializes an executable tree, entry point first.
#[must_use]
pub fn serialize_xptr(entry: &Rc<Xptr>, interns: &Interns) -> Vec<u8> {
    let tree = entry.collect_tree();
    let mut out = Vec::new();

    out.extend_from_slice(&HEADER_MAGIC.to_be_bytes());
    out.extend_from_slice(&(tree.len() as u32).to_be_bytes());
    out.extend_from_slice(&SERIAL_VERSION.to_be_bytes());
    write_string(&mut out, &entry.file_name);

    for xptr in &tree {
        write_xptr(&mut out, xptr, interns);
    }

    out.push(FOOTER_MAGIC);
    // Checksum over the whole file with the checksum field itself zero.
    let placeholder = out.len();
    out.extend_from_slice(&[0, 0]);
    let sum = ones_complement_sum(&out);
    out[placeholder..placeholder + 2].copy_from_slice(&(!sum).to_be_bytes());
    out
}

fn write_xptr(out: &mut Vec<u8>, xptr: &Xptr, interns: &Interns) {
    out.push(EXEC_MAGIC);
    out.extend_from_slice(&xptr.file_line.to_be_bytes());
    write_string(out, &xptr.uuid);

    out.push(INSTR_MAGIC);
    out.extend_from_slice(&(xptr.instr.len() as u32).to_be_bytes());
    for ii in &xptr.instr {
        out.extend_from_slice(&ii.to_be_u32().to_be_bytes());
    }

    out.push(RODATA_MAGIC);
    out.extend_from_slice(&(xptr.rodata.len() as u32).to_be_bytes());
    for rod in &xptr.rodata {
        match rod {
            Rodata::Empty => out.push(TYPE_EMPTY),
            Rodata::Float(v) => {
                out.push(TYPE_FLOAT);
                out.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            Rodata::Int(v) => {
                out.push(TYPE_INT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Rodata::Str(id) => {
                out.push(TYPE_STRPTR);
                write_string(out, interns.get_str(*id));
            }
            Rodata::Bytes(id) => {
                let data = interns.get_bytes(*id);
                out.push(TYPE_BYTES);
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
            }
            Rodata::Xptr(child) => {
                out.push(TYPE_XPTR);
                write_string(out, &child.uuid);
            }
        }
    }

    out.push(LABEL_MAGIC);
    out.extend_from_slice(&(xptr.labels.len() as u32).to_be_bytes());
    for label in &xptr.labels {
        out.extend_from_slice(&label.to_be_bytes());
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32 + 1).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

// ----------------------------------------------------------------------
// Reading
// ----------------------------------------------------------------------

/// A rodata slot before uuid references are patched.
pub(crate) enum RawRodata {
    Done(Rodata),
    XptrRef(String),
}

/// One executable record before cross-references are resolved. Shared with
/// the reassembler, which produces the same shape from text.
pub(crate) struct RawXptr {
    pub(crate) file_line: u32,
    pub(crate) uuid: String,
    pub(crate) instr: Vec<Instr>,
    pub(crate) rodata: Vec<RawRodata>,
    pub(crate) labels: Vec<u16>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> RunResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        if end > self.data.len() {
            return Err(truncated());
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> RunResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> RunResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> RunResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> RunResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(b.try_into().expect("8-byte slice")))
    }

    fn string(&mut self) -> RunResult<String> {
        let len = self.u32()? as usize;
        if len == 0 {
            return Err(RunError::runtime("byte code string missing terminator"));
        }
        let bytes = self.take(len)?;
        if bytes[len - 1] != 0 {
            return Err(RunError::runtime("byte code string missing terminator"));
        }
        String::from_utf8(bytes[..len - 1].to_vec())
            .map_err(|_| RunError::runtime("byte code string is not UTF-8"))
    }
}

/// Reads a serialized tree back into executables, returning the entry
/// point (the first record).
pub fn deserialize_xptr(data: &[u8], interns: &mut Interns) -> RunResult<Rc<Xptr>> {
    if ones_complement_sum(data) != 0xFFFF {
        return Err(bad_checksum());
    }

    let mut r = Reader { data, pos: 0 };
    if r.u32()? != HEADER_MAGIC {
        return Err(RunError::runtime("byte code file bad magic number"));
    }
    let count = r.u32()? as usize;
    let version = r.u16()?;
    if version != SERIAL_VERSION {
        return Err(RunError::runtime(format!("unsupported byte code version {version}")));
    }
    let file_name = r.string()?;
    if count == 0 {
        return Err(RunError::runtime("byte code file has no executables"));
    }

    let mut records = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        records.push(read_xptr(&mut r, interns)?);
    }

    if r.u8()? != FOOTER_MAGIC {
        return Err(RunError::runtime("byte code file bad footer"));
    }
    let _checksum = r.u16()?;
    if r.pos != data.len() {
        return Err(RunError::runtime("trailing data after byte code footer"));
    }

    resolve_tree(records, &file_name)
}

fn read_xptr(r: &mut Reader<'_>, interns: &mut Interns) -> RunResult<RawXptr> {
    if r.u8()? != EXEC_MAGIC {
        return Err(RunError::runtime("byte code executable bad magic"));
    }
    let file_line = r.u32()?;
    let uuid = r.string()?;

    if r.u8()? != INSTR_MAGIC {
        return Err(RunError::runtime("byte code instruction section bad magic"));
    }
    let n_instr = r.u32()? as usize;
    let mut instr = Vec::with_capacity(n_instr.min(65536));
    for _ in 0..n_instr {
        instr.push(Instr::from_be_u32(r.u32()?)?);
    }

    if r.u8()? != RODATA_MAGIC {
        return Err(RunError::runtime("byte code rodata section bad magic"));
    }
    let n_rodata = r.u32()? as usize;
    let mut rodata = Vec::with_capacity(n_rodata.min(65536));
    for _ in 0..n_rodata {
        let tag = r.u8()?;
        let slot = match tag {
            TYPE_EMPTY => RawRodata::Done(Rodata::Empty),
            TYPE_FLOAT => RawRodata::Done(Rodata::Float(f64::from_bits(r.u64()?))),
            TYPE_INT => RawRodata::Done(Rodata::Int(r.u64()?.cast_signed())),
            TYPE_STRPTR => {
                let s = r.string()?;
                RawRodata::Done(Rodata::Str(interns.intern(&s)))
            }
            TYPE_BYTES => {
                let len = r.u32()? as usize;
                let bytes = r.take(len)?;
                RawRodata::Done(Rodata::Bytes(interns.intern_bytes(bytes)))
            }
            TYPE_XPTR => RawRodata::XptrRef(r.string()?),
            other => {
                return Err(RunError::runtime(format!("unknown rodata tag {other}")));
            }
        };
        rodata.push(slot);
    }

    if r.u8()? != LABEL_MAGIC {
        return Err(RunError::runtime("byte code label section bad magic"));
    }
    let n_label = r.u32()? as usize;
    let mut labels = Vec::with_capacity(n_label.min(65536));
    for _ in 0..n_label {
        labels.push(r.u16()?);
    }

    Ok(RawXptr {
        file_line,
        uuid,
        instr,
        rodata,
        labels,
    })
}

/// Second phase: patch uuid references into shared `Rc` edges, bottom-up.
pub(crate) fn resolve_tree(records: Vec<RawXptr>, file_name: &str) -> RunResult<Rc<Xptr>> {
    let index: AHashMap<String, usize> = records
        .iter()
        .enumerate()
        .map(|(i, rec)| (rec.uuid.clone(), i))
        .collect();
    if index.len() != records.len() {
        return Err(RunError::runtime("duplicate executable uuid"));
    }

    let n = records.len();
    let mut records: Vec<Option<RawXptr>> = records.into_iter().map(Some).collect();
    let mut built: Vec<Option<Rc<Xptr>>> = vec![None; n];
    let mut visiting = vec![false; n];

    build(0, &index, &mut records, &mut built, &mut visiting, file_name)?;
    Ok(built[0].as_ref().expect("entry built").clone())
}

fn build(
    i: usize,
    index: &AHashMap<String, usize>,
    records: &mut Vec<Option<RawXptr>>,
    built: &mut Vec<Option<Rc<Xptr>>>,
    visiting: &mut Vec<bool>,
    file_name: &str,
) -> RunResult<()> {
    if built[i].is_some() {
        return Ok(());
    }
    if visiting[i] {
        return Err(RunError::runtime("circular executable reference"));
    }
    visiting[i] = true;

    let rec = records[i].take().expect("record visited once");
    let mut rodata = Vec::with_capacity(rec.rodata.len());
    for slot in rec.rodata {
        match slot {
            RawRodata::Done(rod) => rodata.push(rod),
            RawRodata::XptrRef(uuid) => {
                if uuid == rec.uuid {
                    return Err(RunError::runtime("executable references itself"));
                }
                let Some(&child) = index.get(&uuid) else {
                    return Err(RunError::runtime(format!("unresolved executable reference '{uuid}'")));
                };
                build(child, index, records, built, visiting, file_name)?;
                rodata.push(Rodata::Xptr(built[child].as_ref().expect("child built").clone()));
            }
        }
    }

    visiting[i] = false;
    built[i] = Some(Rc::new(Xptr {
        instr: rec.instr.into_boxed_slice(),
        rodata: rodata.into_boxed_slice(),
        labels: rec.labels.into_boxed_slice(),
        uuid: rec.uuid,
        file_name: file_name.to_owned(),
        file_line: rec.file_line,
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Opcode;

    fn sample_tree(interns: &mut Interns) -> Rc<Xptr> {
        let hello = interns.intern("hello");
        let blob = interns.intern_bytes(b"\x00\x01\x02");
        let child = Rc::new(Xptr {
            instr: Box::new([
                Instr::new(Opcode::PushZero, 0, 0),
                Instr::new(Opcode::ReturnValue, 0, 0),
            ]),
            rodata: Box::new([Rodata::Int(-7), Rodata::Float(1.5)]),
            labels: Box::new([0, 1]),
            uuid: "child-uuid".to_owned(),
            file_name: "t.evc".to_owned(),
            file_line: 3,
        });
        Rc::new(Xptr {
            instr: Box::new([
                Instr::new(Opcode::DefFunc, 0, 2),
                Instr::new(Opcode::Pop, 0, 0),
                Instr::new(Opcode::End, 0, 0),
            ]),
            rodata: Box::new([
                Rodata::Str(hello),
                Rodata::Bytes(blob),
                Rodata::Xptr(child),
                Rodata::Empty,
            ]),
            labels: Box::new([]),
            uuid: "root-uuid".to_owned(),
            file_name: "t.evc".to_owned(),
            file_line: 1,
        })
    }

    fn trees_equal(a: &Rc<Xptr>, b: &Rc<Xptr>) -> bool {
        a.uuid == b.uuid
            && a.file_line == b.file_line
            && a.instr == b.instr
            && a.labels == b.labels
            && a.rodata.len() == b.rodata.len()
            && a.rodata.iter().zip(b.rodata.iter()).all(|(x, y)| match (x, y) {
                (Rodata::Xptr(cx), Rodata::Xptr(cy)) => trees_equal(cx, cy),
                (x, y) => x.same_const(y),
            })
    }

    #[test]
    fn checksum_sums_to_ones_complement_zero() {
        let mut interns = Interns::new();
        let tree = sample_tree(&mut interns);
        let bytes = serialize_xptr(&tree, &interns);
        assert_eq!(ones_complement_sum(&bytes), 0xFFFF);
    }

    #[test]
    fn round_trip_preserves_tree() {
        let mut interns = Interns::new();
        let tree = sample_tree(&mut interns);
        let bytes = serialize_xptr(&tree, &interns);
        let back = deserialize_xptr(&bytes, &mut interns).unwrap();
        assert!(trees_equal(&tree, &back));

        // Reserializing what we read reproduces the file byte for byte.
        let again = serialize_xptr(&back, &interns);
        assert_eq!(bytes, again);
    }

    #[test]
    fn any_single_byte_flip_is_detected() {
        let mut interns = Interns::new();
        let tree = sample_tree(&mut interns);
        let bytes = serialize_xptr(&tree, &interns);
        for i in 0..bytes.len() {
            let mut corrupt = bytes.clone();
            corrupt[i] ^= 0x40;
            let err = deserialize_xptr(&corrupt, &mut interns);
            assert!(err.is_err(), "flip at byte {i} went undetected");
        }
    }

    #[test]
    fn truncation_is_an_error() {
        let mut interns = Interns::new();
        let tree = sample_tree(&mut interns);
        let bytes = serialize_xptr(&tree, &interns);
        assert!(deserialize_xptr(&bytes[..bytes.len() - 3], &mut interns).is_err());
    }

    #[test]
    fn trailing_data_is_an_error() {
        let mut interns = Interns::new();
        let tree = sample_tree(&mut interns);
        let mut bytes = serialize_xptr(&tree, &interns);
        // Appending two zero bytes keeps the ones' complement sum intact
        // for either file parity, so only the trailing-data check can
        // reject this input.
        bytes.extend_from_slice(&[0, 0]);
        let err = deserialize_xptr(&bytes, &mut interns).unwrap_err();
        assert!(err.message().contains("trailing"));
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let mut interns = Interns::new();
        let orphan = Rc::new(Xptr {
            instr: Box::new([Instr::new(Opcode::End, 0, 0)]),
            rodata: Box::new([]),
            labels: Box::new([]),
            uuid: "gone".to_owned(),
            file_name: "t.evc".to_owned(),
            file_line: 1,
        });
        let root = Rc::new(Xptr {
            instr: Box::new([Instr::new(Opcode::End, 0, 0)]),
            rodata: Box::new([Rodata::Xptr(orphan)]),
            labels: Box::new([]),
            uuid: "root".to_owned(),
            file_name: "t.evc".to_owned(),
            file_line: 1,
        });
        let mut bytes = serialize_xptr(&root, &interns);
        // Drop the child record: rewrite the count to 1 and rebuild the
        // file by reserializing only the root's bytes is fiddly, so fake
        // it the direct way — serialize a root whose child uuid points
        // nowhere.
        let needle = b"gone";
        let at = bytes
            .windows(needle.len())
            .rposition(|w| w == needle)
            .expect("uuid in file");
        bytes[at..at + 4].copy_from_slice(b"losr");
        // Fix the checksum so only the dangling reference can fail.
        let len = bytes.len();
        bytes[len - 2..].copy_from_slice(&[0, 0]);
        let sum = ones_complement_sum(&bytes);
        bytes[len - 2..].copy_from_slice(&(!sum).to_be_bytes());
        let err = deserialize_xptr(&bytes, &mut interns).unwrap_err();
        assert!(err.message().contains("unresolved") || err.message().contains("circular"));
    }
}
