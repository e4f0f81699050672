// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! The domain-name wire codec.
//!
//! Names are handled in three representations:
//!
//! 1. **Compressed wire form**, as found inside a DNS message, where a
//!    label length with the two high bits set introduces a pointer to a
//!    prior occurrence of the name's suffix.
//! 2. **Uncompressed wire form**: length-prefixed labels ending with
//!    the root label, at most [`MAX_WIRE_LEN`] octets in total.
//! 3. **Presentation form**: printable ASCII with `.` separators,
//!    special characters escaped with a backslash and non-printable
//!    octets rendered as three-digit decimal escapes.
//!
//! [`unpack`] converts (1) to (2), following pointers defensively;
//! [`pack`] converts (2) to (1) using a [`CompressionTable`] of names
//! already written into the message; [`to_ascii`] and [`from_ascii`]
//! convert between (2) and (3).

use std::fmt;

use arrayvec::ArrayVec;

/// The maximum length of a single label.
pub const MAX_LABEL_LEN: usize = 63;

/// The maximum length of a name in uncompressed wire form, including
/// the root label.
pub const MAX_WIRE_LEN: usize = 255;

/// The two high bits of a label length octet that mark a compression
/// pointer.
const COMPRESSION_FLAGS: u8 = 0xc0;

/// The highest message offset a compression pointer can express.
const POINTER_MAX: usize = 0x3fff;

/// An uncompressed wire-form name held inline.
pub type WireName = ArrayVec<u8, MAX_WIRE_LEN>;

////////////////////////////////////////////////////////////////////////
// UNPACKING (COMPRESSED WIRE FORM -> UNCOMPRESSED WIRE FORM)         //
////////////////////////////////////////////////////////////////////////

/// Decodes the (possibly compressed) name starting at `msg[start]`
/// into uncompressed wire form in `dst`, following compression
/// pointers.
///
/// On success, the number of octets the name occupies *at* `start`
/// (that is, up to and including the first pointer, if any) is
/// returned; this is how far a caller's cursor advances.
///
/// Decoding is defensive: pointers may not target an offset at or past
/// the end of the message, the cumulative number of octets visited may
/// not exceed the message length (which bounds any pointer loop), and
/// a label length whose two high bits are `01` or `10` is rejected.
pub fn unpack(msg: &[u8], start: usize, dst: &mut WireName) -> Result<usize> {
    dst.clear();
    if start >= msg.len() {
        return Err(Error::UnexpectedEom);
    }

    let mut src = start;
    let mut first_chunk_len = None;
    let mut visited = 0usize;

    loop {
        let len = *msg.get(src).ok_or(Error::UnexpectedEom)?;
        src += 1;
        match len & COMPRESSION_FLAGS {
            0 => {
                if len == 0 {
                    dst.try_push(0).or(Err(Error::NameTooLong))?;
                    break;
                }
                let end = src + len as usize;
                if end > msg.len() {
                    return Err(Error::UnexpectedEom);
                }
                dst.try_extend_from_slice(&msg[src - 1..end])
                    .or(Err(Error::NameTooLong))?;
                visited += len as usize + 1;
                src = end;
            }
            COMPRESSION_FLAGS => {
                let low = *msg.get(src).ok_or(Error::UnexpectedEom)?;
                first_chunk_len.get_or_insert(src + 1 - start);
                let target = (((len & !COMPRESSION_FLAGS) as usize) << 8) | low as usize;
                if target >= msg.len() {
                    return Err(Error::InvalidPointer);
                }
                visited += 2;
                if visited >= msg.len() {
                    // We have consumed at least as many octets as the
                    // message contains, so the pointers must form a
                    // loop.
                    return Err(Error::CompressionLoop);
                }
                src = target;
            }
            _ => return Err(Error::BadLabelType),
        }
    }

    Ok(first_chunk_len.unwrap_or(src - start))
}

////////////////////////////////////////////////////////////////////////
// PRESENTATION FORM CONVERSION                                       //
////////////////////////////////////////////////////////////////////////

/// Converts an uncompressed wire-form name into presentation form,
/// writing into `dst` and returning the number of bytes written.
///
/// The output is absolute: every name ends with a dot, and the root
/// renders as `"."` alone. Characters special in zone files (`"`,
/// `.`, `;`, `\`, `(`, `)`, `@`, `$`) are escaped with a backslash,
/// and octets outside `0x21..=0x7e` are emitted as three-digit decimal
/// escapes.
pub fn to_ascii(wire: &[u8], dst: &mut [u8]) -> Result<usize> {
    let mut src = 0;
    let mut out = 0;

    loop {
        let len = *wire.get(src).ok_or(Error::UnexpectedEom)? as usize;
        src += 1;
        if len == 0 {
            break;
        }
        if len > MAX_LABEL_LEN {
            return Err(Error::BadLabelType);
        }
        if src + len > wire.len() {
            return Err(Error::UnexpectedEom);
        }
        for &c in &wire[src..src + len] {
            if special(c) {
                if dst.len() - out < 2 {
                    return Err(Error::BufferTooSmall);
                }
                dst[out] = b'\\';
                dst[out + 1] = c;
                out += 2;
            } else if !printable(c) {
                if dst.len() - out < 4 {
                    return Err(Error::BufferTooSmall);
                }
                dst[out] = b'\\';
                dst[out + 1] = b'0' + c / 100;
                dst[out + 2] = b'0' + c % 100 / 10;
                dst[out + 3] = b'0' + c % 10;
                out += 4;
            } else {
                if dst.len() - out < 1 {
                    return Err(Error::BufferTooSmall);
                }
                dst[out] = c;
                out += 1;
            }
        }
        src += len;
        if out >= dst.len() {
            return Err(Error::BufferTooSmall);
        }
        dst[out] = b'.';
        out += 1;
    }

    if out == 0 {
        // The root name.
        if dst.is_empty() {
            return Err(Error::BufferTooSmall);
        }
        dst[0] = b'.';
        out = 1;
    }
    Ok(out)
}

/// Converts a presentation-form name into uncompressed wire form. A
/// trailing dot is accepted but not required; the root label is always
/// appended. Backslash escapes (`\X` and `\DDD`) are decoded.
pub fn from_ascii(src: &[u8], dst: &mut WireName) -> Result<()> {
    dst.clear();
    if src == b"." || src.is_empty() {
        dst.try_push(0).or(Err(Error::NameTooLong))?;
        return Ok(());
    }

    let mut label = ArrayVec::<u8, MAX_LABEL_LEN>::new();
    let mut iter = src.iter().copied().peekable();

    while let Some(c) = iter.next() {
        let c = if c == b'\\' {
            match iter.next() {
                Some(d @ b'0'..=b'9') => {
                    // A \DDD decimal escape.
                    let d2 = iter.next().filter(u8::is_ascii_digit).ok_or(Error::BadEscape)?;
                    let d3 = iter.next().filter(u8::is_ascii_digit).ok_or(Error::BadEscape)?;
                    let value =
                        (d - b'0') as u16 * 100 + (d2 - b'0') as u16 * 10 + (d3 - b'0') as u16;
                    if value > 255 {
                        return Err(Error::BadEscape);
                    }
                    value as u8
                }
                Some(other) => other,
                None => return Err(Error::BadEscape),
            }
        } else if c == b'.' {
            if label.is_empty() {
                // An empty interior label (e.g. "a..b").
                return Err(Error::BadEscape);
            }
            push_label(dst, &label)?;
            label.clear();
            if iter.peek().is_none() {
                // Trailing dot: the name was absolute.
                dst.try_push(0).or(Err(Error::NameTooLong))?;
                return Ok(());
            }
            continue;
        } else {
            c
        };
        label.try_push(c).or(Err(Error::LabelTooLong))?;
    }

    if !label.is_empty() {
        push_label(dst, &label)?;
    }
    dst.try_push(0).or(Err(Error::NameTooLong))?;
    Ok(())
}

fn push_label(dst: &mut WireName, label: &[u8]) -> Result<()> {
    // Reserve one octet of the wire budget for the final root label.
    if dst.len() + label.len() + 1 >= MAX_WIRE_LEN {
        return Err(Error::NameTooLong);
    }
    dst.try_push(label.len() as u8).or(Err(Error::NameTooLong))?;
    dst.try_extend_from_slice(label).or(Err(Error::NameTooLong))?;
    Ok(())
}

/// In non-internationalized US-ASCII (per the DNS specification), is
/// this character special ("in need of quoting")?
fn special(c: u8) -> bool {
    matches!(c, b'"' | b'.' | b';' | b'\\' | b'(' | b')' | b'@' | b'$')
}

/// In non-internationalized US-ASCII, is this character visible and
/// not a space when printed?
fn printable(c: u8) -> bool {
    c > 0x20 && c < 0x7f
}

////////////////////////////////////////////////////////////////////////
// PACKING (UNCOMPRESSED WIRE FORM -> COMPRESSED WIRE FORM)           //
////////////////////////////////////////////////////////////////////////

/// The table of names already packed into a response, used for
/// compression.
///
/// Entries are offsets into the message buffer. Entry 0 is reserved
/// and always refers to the start of the message (the response
/// header); name entries follow. The table holds at most
/// [`crate::message::COMPRESSED_NAMES_MAX`] entries; once full,
/// further names are packed without being recorded (they can still
/// point *at* recorded names).
#[derive(Clone, Debug)]
pub struct CompressionTable {
    offsets: ArrayVec<u16, { crate::message::COMPRESSED_NAMES_MAX }>,
}

impl CompressionTable {
    pub fn new() -> Self {
        let mut offsets = ArrayVec::new();
        offsets.push(0);
        Self { offsets }
    }

    /// Clears all name entries, leaving the reserved message-base
    /// entry.
    pub fn reset(&mut self) {
        self.offsets.clear();
        self.offsets.push(0);
    }

    fn record(&mut self, offset: usize) {
        if !self.offsets.is_full() && offset <= POINTER_MAX {
            self.offsets.push(offset as u16);
        }
    }

    fn entries(&self) -> &[u16] {
        &self.offsets[1..]
    }
}

impl Default for CompressionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Packs the uncompressed wire-form name `src` into the message buffer
/// `msg` at offset `at`, compressing against `table` and recording the
/// name's position in it. Returns the number of octets written.
///
/// `msg` must begin at the DNS header of the message under
/// construction, since compression pointer offsets are relative to it.
/// On failure nothing is recorded in the table.
pub fn pack(src: &[u8], msg: &mut [u8], at: usize, table: &mut CompressionTable) -> Result<usize> {
    // Check that the name we are about to add is legal.
    let mut total = 0usize;
    let mut off = 0usize;
    loop {
        let n = *src.get(off).ok_or(Error::UnexpectedEom)? as usize;
        if n > MAX_LABEL_LEN {
            return Err(Error::BadLabelType);
        }
        total += n + 1;
        if total > MAX_WIRE_LEN {
            return Err(Error::NameTooLong);
        }
        off += n + 1;
        if n == 0 {
            break;
        }
    }

    let table_len_before = table.offsets.len();
    let mut srcp = 0usize;
    let mut dstp = at;
    let mut first = true;

    loop {
        let n = src[srcp] as usize;
        if n != 0 {
            // Look to see whether we can use a pointer for the
            // remaining suffix.
            if let Some(target) = find_suffix(msg, &src[srcp..], table) {
                if msg.len() - dstp < 2 {
                    table.offsets.truncate(table_len_before);
                    return Err(Error::BufferTooSmall);
                }
                msg[dstp] = (target >> 8) as u8 | COMPRESSION_FLAGS;
                msg[dstp + 1] = (target & 0xff) as u8;
                return Ok(dstp + 2 - at);
            }
            // Not found; remember where this name starts so later
            // names can point at it.
            if first {
                table.record(dstp);
                first = false;
            }
        }
        // Copy the label (or the final root label) to the buffer.
        if n + 1 > msg.len() - dstp {
            table.offsets.truncate(table_len_before);
            return Err(Error::BufferTooSmall);
        }
        msg[dstp..dstp + n + 1].copy_from_slice(&src[srcp..srcp + n + 1]);
        srcp += n + 1;
        dstp += n + 1;
        if n == 0 {
            break;
        }
    }

    Ok(dstp - at)
}

/// Searches the names recorded in `table` for one whose suffix equals
/// the uncompressed wire-form name `suffix`, returning its offset in
/// `msg`.
fn find_suffix(msg: &[u8], suffix: &[u8], table: &CompressionTable) -> Option<usize> {
    for &entry in table.entries() {
        let mut sp = entry as usize;
        // Walk the label positions of the recorded name; stop at the
        // root label, a compression pointer, or an unusable offset.
        while sp < msg.len()
            && msg[sp] != 0
            && msg[sp] & COMPRESSION_FLAGS == 0
            && sp <= POINTER_MAX
        {
            if suffix_eq(msg, sp, suffix) {
                return Some(sp);
            }
            sp += msg[sp] as usize + 1;
        }
    }
    None
}

/// Compares the name at `msg[at]` (following compression pointers)
/// with the uncompressed name `suffix` for byte equality.
fn suffix_eq(msg: &[u8], at: usize, suffix: &[u8]) -> bool {
    let mut cp = at;
    let mut dn = 0usize;
    let mut hops = 0usize;

    loop {
        let Some(&n) = msg.get(cp) else { return false };
        match n & COMPRESSION_FLAGS {
            0 => {
                if suffix.get(dn) != Some(&n) {
                    return false;
                }
                if n == 0 {
                    return true;
                }
                let len = n as usize;
                if cp + 1 + len > msg.len() || dn + 1 + len > suffix.len() {
                    return false;
                }
                if msg[cp + 1..cp + 1 + len] != suffix[dn + 1..dn + 1 + len] {
                    return false;
                }
                cp += len + 1;
                dn += len + 1;
            }
            COMPRESSION_FLAGS => {
                let Some(&low) = msg.get(cp + 1) else { return false };
                cp = (((n & !COMPRESSION_FLAGS) as usize) << 8) | low as usize;
                // Recorded names were validated when packed, but bound
                // the pointer chase anyway.
                hops += 1;
                if hops > msg.len() {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error encountered while encoding or decoding a domain name. All
/// variants are format errors from the point of view of the query
/// pipeline.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    /// A label exceeded 63 octets.
    LabelTooLong,

    /// A name exceeded 255 octets in uncompressed wire form.
    NameTooLong,

    /// The message ended in the middle of a name.
    UnexpectedEom,

    /// A compression pointer targeted an offset outside the message.
    InvalidPointer,

    /// Compression pointers formed a loop.
    CompressionLoop,

    /// A label length octet had high bits `01` or `10`.
    BadLabelType,

    /// A presentation-form escape sequence was malformed.
    BadEscape,

    /// The output buffer was exhausted.
    BufferTooSmall,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LabelTooLong => f.write_str("label exceeds 63 octets"),
            Self::NameTooLong => f.write_str("name exceeds 255 octets"),
            Self::UnexpectedEom => f.write_str("unexpected end of message in name"),
            Self::InvalidPointer => f.write_str("compression pointer out of range"),
            Self::CompressionLoop => f.write_str("compression pointer loop"),
            Self::BadLabelType => f.write_str("malformed label length"),
            Self::BadEscape => f.write_str("malformed escape sequence"),
            Self::BufferTooSmall => f.write_str("output buffer exhausted"),
        }
    }
}

impl std::error::Error for Error {}

/// The type returned by fallible name codec functions.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
