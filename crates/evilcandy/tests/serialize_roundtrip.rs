//! Byte-code file round-trip tests: serializing a compiled tree and
//! reading it back is the identity, re-writing reproduces the identical
//! file, and corruption is caught by the checksum.

use std::rc::Rc;

use evilcandy::{CollectStringPrint, Interp, Rodata, Xptr};
use pretty_assertions::assert_eq;

const PROGRAM: &str = r#"
let limit = 5;
function triangle(n) {
    let total = 0;
    for (let i = 1; i <= n; i = i + 1) { total = total + i; }
    return total;
}
function shout(msg, bang = "!") { return msg + bang; }
print(triangle(limit));
print(shout("hé"));
"#;

fn trees_equal(a: &Rc<Xptr>, b: &Rc<Xptr>) -> bool {
    a.uuid == b.uuid
        && a.file_line == b.file_line
        && a.file_name == b.file_name
        && a.instr == b.instr
        && a.labels == b.labels
        && a.rodata.len() == b.rodata.len()
        && a.rodata.iter().zip(b.rodata.iter()).all(|(x, y)| match (x, y) {
            (Rodata::Xptr(cx), Rodata::Xptr(cy)) => trees_equal(cx, cy),
            (x, y) => x.same_const(y),
        })
}

#[test]
fn deserialize_serialize_is_identity() {
    let mut interp = Interp::new();
    let tree = interp.compile(PROGRAM, "t.evc").unwrap();
    let bytes = interp.serialize(&tree);
    let back = interp.deserialize(&bytes).unwrap();

    assert!(trees_equal(&tree, &back));

    // Writing the reread tree reproduces the file byte for byte.
    let again = interp.serialize(&back);
    assert_eq!(bytes, again);
}

#[test]
fn deserialized_code_runs_identically() {
    let writer = CollectStringPrint::new();
    let source_out = writer.handle();
    let mut interp = Interp::with_writer(Box::new(writer));
    let tree = interp.compile(PROGRAM, "t.evc").unwrap();
    interp.execute(&tree).unwrap();

    let bytes = interp.serialize(&tree);

    let writer = CollectStringPrint::new();
    let loaded_out = writer.handle();
    let mut fresh = Interp::with_writer(Box::new(writer));
    let back = fresh.deserialize(&bytes).unwrap();
    fresh.execute(&back).unwrap();

    assert_eq!(&*source_out.borrow(), "15\nhé!\n");
    assert_eq!(&*source_out.borrow(), &*loaded_out.borrow());
}

#[test]
fn checksum_catches_every_single_byte_flip() {
    let mut interp = Interp::new();
    let tree = interp.compile(PROGRAM, "t.evc").unwrap();
    let bytes = interp.serialize(&tree);

    for i in 0..bytes.len() {
        let mut corrupt = bytes.clone();
        corrupt[i] ^= 0x10;
        assert!(
            interp.deserialize(&corrupt).is_err(),
            "flipping byte {i} of {} went undetected",
            bytes.len()
        );
    }
}

#[test]
fn bad_checksum_names_itself() {
    let mut interp = Interp::new();
    let tree = interp.compile("let x = 1;", "t.evc").unwrap();
    let mut bytes = interp.serialize(&tree);
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xff;
    let err = interp.deserialize(&bytes).unwrap_err();
    assert!(err.message().contains("bad checksum"), "got: {err}");
}

#[test]
fn foreach_iter_drives_sequences() {
    // FOREACH_ITER has no surface syntax yet; hand-written byte code is
    // how it is exercised. The loop drains a two-element list: push the
    // next element and bump the counter, branch out when exhausted.
    let listing = r"
.start main 1
.rodata int 10
.rodata int 20
def_list 0 0
push_const 0 0
list_append 0 0
push_const 0 1
list_append 0 0
push_zero 0 0       ; iteration counter
foreach_iter 0 2    ; exhausted -> skip the body
pop 0 0             ; drop the element
b 0 -3              ; next iteration
pop 0 0             ; drop the counter
pop 0 0             ; drop the list
end 0 0
.end
";
    let mut interp = Interp::new();
    let tree = interp.reassemble(listing).unwrap();
    interp.execute(&tree).unwrap();
    // Only the globals object survives: the loop balanced the stack.
    assert_eq!(interp.heap_live(), 1);
}

#[test]
fn reassembled_listing_matches_the_binary_path() {
    // A hand-written listing and the serializer meet at the same tree
    // shape: reassemble, serialize, reread, and compare.
    let listing = r#"
.evilcandy hand.evc
.start entry 1
.rodata int 41
.rodata string "x"
.rodata xptr bump
def_func 0 2
pop 0 0
end 0 0
.end
.start bump 2
push_const 0 0
return_value 0 0
.rodata int 1
.end
"#;
    let mut interp = Interp::new();
    let tree = interp.reassemble(listing).unwrap();
    let bytes = interp.serialize(&tree);
    let back = interp.deserialize(&bytes).unwrap();
    assert!(trees_equal(&tree, &back));
}
