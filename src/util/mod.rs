//! Provides various internal utilities.

use std::fmt;


/// A wrapper that can be used to format a byte slice as contiguous
/// hexadecimal, using the `{:X}` format specifier.
pub struct BytesFmt<'a>(pub &'a [u8]);

impl fmt::UpperHex for BytesFmt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}
