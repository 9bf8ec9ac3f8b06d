//! Positioned read helpers shared by the decoders.

use std::io::{ErrorKind, Read, Seek, SeekFrom};

use crate::error::{Error, Result};

/// Reads until `buf` is full or the source is exhausted.
///
/// Returns the number of bytes read, which is less than `buf.len()` only at
/// end of input.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io_simple(e)),
        }
    }
    Ok(filled)
}

/// Fills `buf` from `offset`, failing with `ShortRead` if the source ends early.
pub(crate) fn read_exact_at<R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    reader.seek(SeekFrom::Start(offset))?;
    let n = read_full(reader, buf)?;
    if n < buf.len() {
        return Err(Error::short_read(what, buf.len(), n));
    }
    Ok(())
}

/// Rounds `value` up to the next multiple of `align`.
pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}
