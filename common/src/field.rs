use std::fmt;

/// Copies `source` into `destination` without ever writing past its end.
///
/// At most `destination.len() - 1` bytes are copied, a source NUL ends the
/// copy early, and every byte after the copied prefix is zeroed so the
/// buffer always ends with a terminator. A `None` source leaves an empty
/// string behind. A zero-length destination is left untouched.
pub fn copy_truncated(source: Option<&[u8]>, destination: &mut [u8]) {
    let Some(limit) = destination.len().checked_sub(1) else {
        return;
    };

    let Some(source) = source else {
        destination.fill(0);
        return;
    };

    let len = source
        .iter()
        .position(|&byte| byte == 0)
        .unwrap_or(source.len())
        .min(limit);

    destination[..len].copy_from_slice(&source[..len]);
    destination[len..].fill(0);
}

/// Fixed-capacity, NUL-terminated text buffer. `N` includes the terminator.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TextField<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> TextField<N> {
    pub const CAPACITY: usize = N;

    pub const fn empty() -> Self {
        Self { bytes: [0; N] }
    }

    pub fn new(value: &str) -> Self {
        let mut field = Self::empty();
        field.set(Some(value));
        field
    }

    pub fn set(&mut self, value: Option<&str>) {
        copy_truncated(value.map(str::as_bytes), &mut self.bytes);
    }

    pub fn len(&self) -> usize {
        self.bytes.iter().position(|&byte| byte == 0).unwrap_or(N)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    /// Text up to the terminator. A multi-byte character cut in half by
    /// truncation is dropped from the returned view.
    pub fn as_str(&self) -> &str {
        let bytes = self.as_bytes();
        match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => std::str::from_utf8(&bytes[..err.valid_up_to()]).unwrap_or_default(),
        }
    }

    /// Full backing buffer, terminator and padding included.
    pub fn raw(&self) -> &[u8; N] {
        &self.bytes
    }

    /// Replaces the backing buffer with `raw`, forcing the final byte to NUL.
    pub fn load_raw(&mut self, raw: &[u8]) {
        let len = raw.len().min(N);
        self.bytes[..len].copy_from_slice(&raw[..len]);
        self.bytes[len..].fill(0);
        if let Some(last) = self.bytes.last_mut() {
            *last = 0;
        }
    }
}

impl<const N: usize> Default for TextField<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> fmt::Debug for TextField<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for TextField<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
