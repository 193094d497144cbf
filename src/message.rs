//! Cursor-based, read-only view over a DNS message.
//!
//! Nothing is copied: names, rdata and the header all borrow from the datagram
//! buffer, so a `DecodedMessage` never outlives the receive call it came from.

use std::cell::Cell;
use std::net::Ipv4Addr;

use hickory_proto::rr::RecordType;

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Question = 0,
    Answer = 1,
    Authority = 2,
    Additional = 3,
}

impl Section {
    const ALL: [Section; 4] = [
        Section::Question,
        Section::Answer,
        Section::Authority,
        Section::Additional,
    ];
}

/// A single resource record (or question entry) inside a message.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    msg: &'a [u8],
    name_offset: usize,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: &'a [u8],
}

impl<'a> Record<'a> {
    pub fn record_type(&self) -> RecordType {
        RecordType::from(self.rtype)
    }

    /// IPv4 address carried by an A record; `None` for other types or a bad rdlength.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        if self.record_type() != RecordType::A {
            return None;
        }
        let octets: [u8; 4] = self.rdata.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    pub fn name(&self) -> Result<String> {
        expand_name(self.msg, self.name_offset)
    }
}

#[derive(Debug)]
pub struct DecodedMessage<'a> {
    buf: &'a [u8],
    id: u16,
    flags: u16,
    counts: [u16; 4],
    starts: [usize; 4],
    // (next record index, byte offset of that record) per section
    cursors: [Cell<(u16, usize)>; 4],
}

/// Parse the header and locate every section. Any read past the end of `buf`,
/// or bytes left over after the last declared record, is `Error::Truncated`.
pub fn decode(buf: &[u8]) -> Result<DecodedMessage<'_>> {
    if buf.len() < HEADER_LEN {
        return Err(Error::Truncated);
    }
    let id = read_u16(buf, 0)?;
    let flags = read_u16(buf, 2)?;
    let mut counts = [0u16; 4];
    for (i, count) in counts.iter_mut().enumerate() {
        *count = read_u16(buf, 4 + i * 2)?;
    }

    let mut starts = [HEADER_LEN; 4];
    let mut pos = HEADER_LEN;
    for section in Section::ALL {
        let idx = section as usize;
        starts[idx] = pos;
        for _ in 0..counts[idx] {
            pos = skip_record(buf, pos, section)?;
        }
    }
    if pos != buf.len() {
        return Err(Error::Truncated);
    }

    let cursors = starts.map(|start| Cell::new((0, start)));
    Ok(DecodedMessage {
        buf,
        id,
        flags,
        counts,
        starts,
        cursors,
    })
}

impl<'a> DecodedMessage<'a> {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    pub fn count(&self, section: Section) -> u16 {
        self.counts[section as usize]
    }

    /// Random access to record `index` of `section`.
    ///
    /// The section keeps a cursor at the last record returned, so walking
    /// forward (sequentially or with gaps) never restarts from the section
    /// head; only stepping backwards does.
    pub fn record(&self, section: Section, index: u16) -> Result<Option<Record<'a>>> {
        let idx = section as usize;
        if index >= self.counts[idx] {
            return Ok(None);
        }
        let (mut at, mut pos) = self.cursors[idx].get();
        if index < at {
            at = 0;
            pos = self.starts[idx];
        }
        while at < index {
            pos = skip_record(self.buf, pos, section)?;
            at += 1;
        }
        let (record, next) = parse_record(self.buf, pos, section)?;
        self.cursors[idx].set((index + 1, next));
        Ok(Some(record))
    }

    /// Lazy iteration over one section, independent of the random-access cursor.
    pub fn records(&self, section: Section) -> Records<'a> {
        let idx = section as usize;
        Records {
            buf: self.buf,
            section,
            pos: self.starts[idx],
            remaining: self.counts[idx],
        }
    }

    /// Dotted name of the first question, if there is one.
    pub fn question_name(&self) -> Option<String> {
        self.record(Section::Question, 0)
            .ok()
            .flatten()
            .and_then(|q| q.name().ok())
    }
}

pub struct Records<'a> {
    buf: &'a [u8],
    section: Section,
    pos: usize,
    remaining: u16,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match parse_record(self.buf, self.pos, self.section) {
            Ok((record, next)) => {
                self.pos = next;
                Some(Ok(record))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

#[inline]
fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    let bytes = buf.get(pos..pos + 2).ok_or(Error::Truncated)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    let bytes = buf.get(pos..pos + 4).ok_or(Error::Truncated)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Step over an encoded name without following pointers.
pub(crate) fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        let len = *buf.get(pos).ok_or(Error::Truncated)?;
        match len & 0xC0 {
            0x00 if len == 0 => return Ok(pos + 1),
            0x00 => {
                pos += 1 + len as usize;
                if pos > buf.len() {
                    return Err(Error::Truncated);
                }
            }
            0xC0 => {
                if pos + 2 > buf.len() {
                    return Err(Error::Truncated);
                }
                return Ok(pos + 2);
            }
            // 0x40 / 0x80 extended label types are not supported
            _ => return Err(Error::Truncated),
        }
    }
}

fn skip_record(buf: &[u8], pos: usize, section: Section) -> Result<usize> {
    parse_record(buf, pos, section).map(|(_, next)| next)
}

fn parse_record(buf: &[u8], pos: usize, section: Section) -> Result<(Record<'_>, usize)> {
    let name_offset = pos;
    let mut pos = skip_name(buf, pos)?;
    let rtype = read_u16(buf, pos)?;
    let class = read_u16(buf, pos + 2)?;
    pos += 4;

    if section == Section::Question {
        let record = Record {
            msg: buf,
            name_offset,
            rtype,
            class,
            ttl: 0,
            rdata: &[],
        };
        return Ok((record, pos));
    }

    let ttl = read_u32(buf, pos)?;
    let rdlen = read_u16(buf, pos + 4)? as usize;
    pos += 6;
    let rdata = buf.get(pos..pos + rdlen).ok_or(Error::Truncated)?;
    let record = Record {
        msg: buf,
        name_offset,
        rtype,
        class,
        ttl,
        rdata,
    };
    Ok((record, pos + rdlen))
}

/// Expand a possibly-compressed name into dotted text.
///
/// Every label and every pointer hop spends from a budget equal to the buffer
/// length, so a pointer cycle ends in `Error::Truncated` instead of spinning.
pub(crate) fn expand_name(buf: &[u8], mut pos: usize) -> Result<String> {
    let mut name = String::new();
    let mut budget = buf.len();
    loop {
        if budget == 0 {
            return Err(Error::Truncated);
        }
        budget -= 1;
        let len = *buf.get(pos).ok_or(Error::Truncated)?;
        match len & 0xC0 {
            0x00 if len == 0 => break,
            0x00 => {
                let start = pos + 1;
                let label = buf
                    .get(start..start + len as usize)
                    .ok_or(Error::Truncated)?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.extend(label.iter().map(|&b| b.to_ascii_lowercase() as char));
                pos = start + len as usize;
            }
            0xC0 => {
                let low = *buf.get(pos + 1).ok_or(Error::Truncated)?;
                pos = (((len & 0x3F) as usize) << 8) | low as usize;
            }
            _ => return Err(Error::Truncated),
        }
    }
    if name.is_empty() {
        name.push('.');
    }
    Ok(name)
}
