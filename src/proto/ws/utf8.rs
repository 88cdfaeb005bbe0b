//! Incremental UTF-8 validation for text messages.
//!
//! Bjoern Hoehrmann's DFA: byte classes feed a transition table whose
//! states are multiples of 12. State 0 accepts; state 12 is the dead
//! reject state. The decoder state persists across frames, so a message
//! may legally end a frame mid-codepoint as long as more frames follow.

pub(crate) const UTF8_ACCEPT: u32 = 0;
pub(crate) const UTF8_REJECT: u32 = 12;

#[rustfmt::skip]
static UTF8D: [u8; 364] = [
    // Byte character classes.
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1, 9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,
    7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7, 7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,
    8,8,2,2,2,2,2,2,2,2,2,2,2,2,2,2, 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
    10,3,3,3,3,3,3,3,3,3,3,3,3,4,3,3, 11,6,6,6,5,8,8,8,8,8,8,8,8,8,8,8,
    // State transitions, indexed by state + class.
     0,12,24,36,60,96,84,12,12,12,48,72, 12,12,12,12,12,12,12,12,12,12,12,12,
    12, 0,12,12,12,12,12, 0,12, 0,12,12, 12,24,12,12,12,12,12,24,12,24,12,12,
    12,12,12,12,12,12,12,24,12,12,12,12, 12,24,12,12,12,12,12,12,12,24,12,12,
    12,12,12,12,12,12,12,36,12,36,12,12, 12,36,12,12,12,12,12,36,12,36,12,12,
    12,36,12,12,12,12,12,12,12,12,12,12,
];

/// Streaming UTF-8 validator carrying its state across frame boundaries.
#[derive(Debug, Clone)]
pub(crate) struct Utf8Validator {
    state: u32,
}

impl Default for Utf8Validator {
    fn default() -> Utf8Validator {
        Utf8Validator { state: UTF8_ACCEPT }
    }
}

impl Utf8Validator {
    /// Consume bytes; returns false once the input can never become
    /// valid UTF-8.
    pub(crate) fn update(&mut self, bytes: &[u8]) -> bool {
        for &byte in bytes {
            let class = UTF8D[byte as usize] as u32;
            self.state = UTF8D[(256 + self.state + class) as usize] as u32;
            if self.state == UTF8_REJECT {
                return false;
            }
        }
        true
    }

    /// True when the consumed input ends on a codepoint boundary.
    pub(crate) fn is_complete(&self) -> bool {
        self.state == UTF8_ACCEPT
    }

    pub(crate) fn reset(&mut self) {
        self.state = UTF8_ACCEPT;
    }
}

/// One-shot validation for close reasons and handshake fields.
pub(crate) fn valid_utf8(bytes: &[u8]) -> bool {
    let mut v = Utf8Validator::default();
    v.update(bytes) && v.is_complete()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ascii_and_multibyte() {
        assert!(valid_utf8(b"Hello"));
        assert!(valid_utf8("κόσμε".as_bytes()));
        assert!(valid_utf8("𐍈".as_bytes()));
        assert!(valid_utf8(b""));
    }

    #[test]
    fn rejects_lone_continuation_and_overlong() {
        assert!(!valid_utf8(&[0x80]));
        assert!(!valid_utf8(&[0xc0, 0x80]));
        assert!(!valid_utf8(&[0xed, 0xa0, 0x80])); // UTF-16 surrogate
        assert!(!valid_utf8(&[0xf5, 0x80, 0x80, 0x80])); // > U+10FFFF
    }

    #[test]
    fn incomplete_tail_is_not_complete_but_not_rejected() {
        let mut v = Utf8Validator::default();
        let bytes = "é".as_bytes();
        assert!(v.update(&bytes[..1]));
        assert!(!v.is_complete());
        assert!(v.update(&bytes[1..]));
        assert!(v.is_complete());
    }

    #[test]
    fn state_persists_across_frame_boundaries() {
        let text = "héllo wörld κόσμε".as_bytes();
        // Split at every byte offset; the validator must accept the whole
        // regardless of where the frame boundary lands.
        for split in 0..text.len() {
            let mut v = Utf8Validator::default();
            assert!(v.update(&text[..split]));
            assert!(v.update(&text[split..]));
            assert!(v.is_complete());
        }
    }

    #[test]
    fn agreement_with_std() {
        for bytes in [
            &[0xe2u8, 0x82, 0xac][..],
            &[0xe2, 0x82][..],
            &[0xff][..],
            &[0xc2, 0xa9][..],
            &[0xf0, 0x9f, 0x92, 0xa9][..],
        ] {
            let ours = valid_utf8(bytes);
            let std = std::str::from_utf8(bytes).is_ok();
            assert_eq!(ours, std, "{:x?}", bytes);
        }
    }
}
