//! Fractional position keys for list children.
//!
//! A list child's parent key is its position: an arbitrary-precision
//! fraction written as a string of base-62 digits (`0-9 < A-Z < a-z`),
//! compared lexicographically. `pos_between` always finds a key strictly
//! between its neighbors, so concurrent inserts at the same index never
//! need to renumber siblings.
//!
//! Generated keys never end in the zero digit, which guarantees that a
//! predecessor key exists for every generated key.

const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u32 = 62;

fn digit_index(byte: u8) -> u32 {
    match byte {
        b'0'..=b'9' => (byte - b'0') as u32,
        b'A'..=b'Z' => (byte - b'A') as u32 + 10,
        b'a'..=b'z' => (byte - b'a') as u32 + 36,
        _ => panic!("invalid position digit: {byte:?}"),
    }
}

/// The position for the first element of an empty list.
pub fn pos_first() -> String {
    pos_between(None, None)
}

/// A position strictly between `lo` and `hi`. `None` bounds mean
/// "before everything" / "after everything" respectively. When both
/// bounds are given, `lo < hi` must hold.
pub fn pos_between(lo: Option<&str>, hi: Option<&str>) -> String {
    debug_assert!(
        match (lo, hi) {
            (Some(lo), Some(hi)) => lo < hi,
            _ => true,
        },
        "pos_between bounds out of order: {lo:?} >= {hi:?}"
    );

    let lo_bytes = lo.unwrap_or("").as_bytes();
    let hi_bytes = hi.unwrap_or("").as_bytes();
    let mut out: Vec<u8> = Vec::new();
    let mut i = 0;

    loop {
        let low = lo_bytes.get(i).map(|b| digit_index(*b)).unwrap_or(0);
        // Once the prefix is strictly below `hi`, the upper bound no
        // longer constrains deeper digits.
        let high = hi_bytes.get(i).map(|b| digit_index(*b)).unwrap_or(BASE);

        if high - low > 1 {
            out.push(DIGITS[(low + (high - low) / 2) as usize]);
            return String::from_utf8(out).expect("positions are ascii");
        }

        // Adjacent (or equal) digits: keep the low digit and refine one
        // level deeper.
        out.push(DIGITS[low as usize]);
        i += 1;
    }
}

/// A position strictly after `pos`.
pub fn pos_after(pos: &str) -> String {
    pos_between(Some(pos), None)
}

/// A position strictly before `pos`.
pub fn pos_before(pos: &str) -> String {
    pos_between(None, Some(pos))
}
