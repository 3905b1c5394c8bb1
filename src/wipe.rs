use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Securely erases a byte region.
///
/// Uses `zeroize`, so the writes survive optimization even when the buffer
/// is about to go out of scope. Call this on any stack or heap copy of key
/// material that is not already wrapped in a zeroize-on-drop type.
pub fn wipe(buf: &mut [u8]) {
    buf.zeroize();
}

/// Compares two byte strings in constant time.
///
/// Returns false on length mismatch without inspecting the contents.
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wipe_clears_every_byte() {
        let mut buf = [0xA5u8; 67];
        wipe(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"same bytes", b"same bytes"));
        assert!(!ct_eq(b"same bytes", b"same byteZ"));
        assert!(!ct_eq(b"short", b"longer input"));
    }
}
