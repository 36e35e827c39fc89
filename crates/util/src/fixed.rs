//! Fixed-width, zero-padded byte strings.
//!
//! Every textual field of the wire protocol occupies a fixed number of bytes.
//! Values shorter than the field are padded with zeros on the right, and the
//! first zero byte terminates the value when reading it back. [`FixedStr`]
//! stores the padded form directly so that equality and hashing operate on
//! the canonical representation.

use std::fmt;

/// Width of a username field on the wire.
pub const USERNAME_LEN: usize = 6;

/// Width of a twiiiiit text field on the wire.
pub const MESSAGE_LEN: usize = 20;

pub type Username = FixedStr<USERNAME_LEN>;
pub type Text = FixedStr<MESSAGE_LEN>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("value of {len} bytes does not fit in a {max}-byte field")]
pub struct FieldTooLong {
    pub len: usize,
    pub max: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FixedStr<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> FixedStr<N> {
    /// The all-zero value. For usernames this doubles as the "no more entries"
    /// marker of a subscription listing.
    pub const EMPTY: Self = Self { bytes: [0; N] };

    /// Builds a field from `value`, stopping at the first zero byte.
    pub fn new(value: &[u8]) -> Result<Self, FieldTooLong> {
        let value = until_nul(value);
        if value.len() > N {
            return Err(FieldTooLong {
                len: value.len(),
                max: N,
            });
        }

        let mut bytes = [0; N];
        bytes[..value.len()].copy_from_slice(value);
        Ok(Self { bytes })
    }

    /// Reads a field back from its padded wire form. Bytes after the first
    /// zero are ignored, so two paddings of the same value compare equal.
    pub fn from_padded(padded: &[u8; N]) -> Self {
        let value = until_nul(padded);
        let mut bytes = [0; N];
        bytes[..value.len()].copy_from_slice(value);
        Self { bytes }
    }

    /// Value bytes, without padding.
    pub fn as_bytes(&self) -> &[u8] {
        until_nul(&self.bytes)
    }

    /// Full padded representation, exactly `N` bytes.
    pub fn padded(&self) -> &[u8; N] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes[0] == 0
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl<const N: usize> TryFrom<&str> for FixedStr<N> {
    type Error = FieldTooLong;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.as_bytes())
    }
}

impl<const N: usize> TryFrom<&[u8]> for FixedStr<N> {
    type Error = FieldTooLong;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "{s:?}"),
            Err(_) => write!(f, "{:?}", self.as_bytes()),
        }
    }
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|b| *b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_short_values_with_zeros() {
        let name = Username::new(b"Bob").unwrap();
        assert_eq!(name.padded(), b"Bob\0\0\0");
        assert_eq!(name.as_bytes(), b"Bob");
        assert_eq!(name.len(), 3);
    }

    #[test]
    fn accepts_value_filling_the_whole_field() {
        let name = Username::new(b"Matteo").unwrap();
        assert_eq!(name.as_bytes(), b"Matteo");
        assert_eq!(name.padded(), b"Matteo");
    }

    #[test]
    fn rejects_values_longer_than_the_field() {
        let err = Username::new(b"Matteo!").unwrap_err();
        assert_eq!(err, FieldTooLong { len: 7, max: 6 });
    }

    #[test]
    fn stops_at_first_nul() {
        let name = Username::new(b"Al\0ice").unwrap();
        assert_eq!(name.as_bytes(), b"Al");
        assert_eq!(name, Username::new(b"Al").unwrap());
    }

    #[test]
    fn from_padded_ignores_garbage_after_terminator() {
        let a = Username::from_padded(b"Bo\0xyz");
        let b = Username::from_padded(b"Bo\0\0\0\0");
        assert_eq!(a, b);
        assert_eq!(a.padded(), b"Bo\0\0\0\0");
    }

    #[test]
    fn empty_is_all_zero() {
        assert!(Username::EMPTY.is_empty());
        assert_eq!(Username::EMPTY.padded(), &[0; USERNAME_LEN]);
        assert!(Username::new(b"").unwrap().is_empty());
        assert!(!Username::new(b"x").unwrap().is_empty());
    }

    #[test]
    fn display_is_lossy_utf8() {
        let text = Text::try_from("Hello world!").unwrap();
        assert_eq!(text.to_string(), "Hello world!");
        assert_eq!(format!("{text:?}"), "\"Hello world!\"");
    }
}
