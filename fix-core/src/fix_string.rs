use std::{borrow, fmt, mem, ops};

/// An owned, validated FIX field value: printable ASCII, no SOH.
#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FixString(Vec<u8>);

/// Borrowed counterpart of [`FixString`], analogous to `str`/`String`.
#[derive(Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct FixStr([u8]);

#[derive(Debug)]
pub struct FixStringError {
    idx: usize,
    value: u8,
}

impl fmt::Display for FixStringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unexpected byte {:#04x} at index {} (SOH and control characters are not allowed)",
            self.value, self.idx
        )
    }
}

impl std::error::Error for FixStringError {}

fn verify_fix_bytes(buf: &[u8]) -> Result<(), FixStringError> {
    for (idx, &c) in buf.iter().enumerate() {
        if c < 0x20 || c > 0x7e {
            return Err(FixStringError { idx, value: c });
        }
    }
    Ok(())
}

impl FixStr {
    pub fn from_ascii(buf: &[u8]) -> Result<&FixStr, FixStringError> {
        verify_fix_bytes(buf)?;
        // SAFETY: just verified all bytes are in the printable ASCII range.
        Ok(unsafe { FixStr::from_ascii_unchecked(buf) })
    }

    /// # Safety
    /// Caller must guarantee `buf` contains only printable ASCII bytes.
    pub unsafe fn from_ascii_unchecked(buf: &[u8]) -> &FixStr {
        // SAFETY: `FixStr` is `#[repr(transparent)]` over `[u8]`.
        unsafe { mem::transmute(buf) }
    }

    pub fn as_utf8(&self) -> &str {
        // SAFETY: ASCII is always valid UTF-8.
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FixStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_utf8().fmt(f)
    }
}

impl fmt::Debug for FixStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixStr({:?})", self.as_utf8())
    }
}

impl AsRef<FixStr> for FixStr {
    fn as_ref(&self) -> &FixStr {
        self
    }
}

impl AsRef<[u8]> for FixStr {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<str> for FixStr {
    fn as_ref(&self) -> &str {
        self.as_utf8()
    }
}

impl ToOwned for FixStr {
    type Owned = FixString;

    fn to_owned(&self) -> FixString {
        // SAFETY: `self` is already validated FixStr content.
        unsafe { FixString::from_ascii_unchecked(self.as_bytes().to_owned()) }
    }
}

impl PartialEq<str> for FixStr {
    fn eq(&self, other: &str) -> bool {
        self.as_utf8() == other
    }
}

impl PartialEq<FixStr> for str {
    fn eq(&self, other: &FixStr) -> bool {
        self == other.as_utf8()
    }
}

impl FixString {
    pub const fn new() -> FixString {
        FixString(Vec::new())
    }

    pub fn from_ascii(buf: Vec<u8>) -> Result<FixString, FixStringError> {
        verify_fix_bytes(&buf)?;
        // SAFETY: just verified.
        Ok(unsafe { FixString::from_ascii_unchecked(buf) })
    }

    /// # Safety
    /// Caller must guarantee `buf` contains only printable ASCII bytes.
    pub unsafe fn from_ascii_unchecked(buf: Vec<u8>) -> FixString {
        FixString(buf)
    }

    /// Build a `FixString` from arbitrary bytes, replacing bytes outside the
    /// printable ASCII range with `?`. Used for diagnostic text fields
    /// (Reject/Logout `Text<58>`) where the input is not itself FIX-encoded.
    pub fn from_ascii_lossy(buf: Vec<u8>) -> FixString {
        let sanitized = buf
            .into_iter()
            .map(|b| if (0x20..=0x7e).contains(&b) { b } else { b'?' })
            .collect();
        FixString(sanitized)
    }

    pub fn as_fix_str(&self) -> &FixStr {
        self
    }
}

impl fmt::Display for FixString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_fix_str().fmt(f)
    }
}

impl fmt::Debug for FixString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_fix_str().fmt(f)
    }
}

impl ops::Deref for FixString {
    type Target = FixStr;

    fn deref(&self) -> &FixStr {
        // SAFETY: content was validated at construction.
        unsafe { FixStr::from_ascii_unchecked(&self.0) }
    }
}

impl borrow::Borrow<FixStr> for FixString {
    fn borrow(&self) -> &FixStr {
        self
    }
}

impl From<&FixStr> for FixString {
    fn from(s: &FixStr) -> FixString {
        s.to_owned()
    }
}

impl TryFrom<&str> for FixString {
    type Error = FixStringError;

    fn try_from(s: &str) -> Result<FixString, FixStringError> {
        FixString::from_ascii(s.as_bytes().to_vec())
    }
}

impl TryFrom<String> for FixString {
    type Error = FixStringError;

    fn try_from(s: String) -> Result<FixString, FixStringError> {
        FixString::from_ascii(s.into_bytes())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for FixString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_utf8())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for FixString {
    fn deserialize<D>(deserializer: D) -> Result<FixString, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FixString::try_from(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let s = FixString::try_from("FIX.4.2").unwrap();
        assert_eq!(s.as_utf8(), "FIX.4.2");
        assert_eq!(s.to_string(), "FIX.4.2");
    }

    #[test]
    fn rejects_soh() {
        assert!(FixString::try_from("bad\u{1}value").is_err());
    }

    #[test]
    fn lossy_replaces_control_bytes() {
        let s = FixString::from_ascii_lossy(b"ok\x01bad".to_vec());
        assert_eq!(s.as_utf8(), "ok?bad");
    }
}
