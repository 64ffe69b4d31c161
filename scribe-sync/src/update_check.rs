//! Structural check of Yrs v1 updates received from peers.
//!
//! Yrs decodes string content without UTF-8 validation and sizes some
//! allocations straight from length fields, so untrusted bytes are walked
//! here before they reach it.
//!
//! ```text
//! Update      := VarUint(clients) ClientBlocks*  DeleteSet
//! ClientBlocks:= VarUint(blocks) VarUint(client) VarUint(clock) Block*
//! Block       := info:u8 (Skip | GC | Item)
//! Item        := [left id] [right id] [parent [parent sub]] Content
//! DeleteSet   := VarUint(clients) (VarUint(client) VarUint(ranges) (clock len)*)*
//! ```
//!
//! Every string must be valid UTF-8, every count must fit in the bytes
//! left, and clocks must stay within 32 bits.

use thiserror::Error;

use crate::codec::{CodecError, Decoder};

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

const TYPE_XML_ELEMENT: u8 = 3;

/// Deepest nesting accepted inside embedded values.
const MAX_VALUE_DEPTH: usize = 64;

/// Signed varints longer than this overflow 62 bits.
const MAX_SIGNED_VAR_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateCheckError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{what} count {count} exceeds the {remaining} bytes left")]
    CountTooLarge {
        what: &'static str,
        count: u64,
        remaining: usize,
    },
    #[error("{0} does not fit in 32 bits")]
    Overflow(&'static str),
    #[error("zero-length block")]
    EmptyBlock,
    #[error("empty delete set entry")]
    EmptyDeleteEntry,
    #[error("unknown block content {0}")]
    UnknownContent(u8),
    #[error("unknown type ref {0}")]
    UnknownTypeRef(u8),
    #[error("unknown value tag {0}")]
    UnknownValueTag(u8),
    #[error("values nested deeper than {MAX_VALUE_DEPTH}")]
    TooDeep,
}

type Result<T> = std::result::Result<T, UpdateCheckError>;

/// Walk a v1 update without decoding it into Yrs structures.
pub fn check_update_v1(bytes: &[u8]) -> Result<()> {
    let mut dec = Decoder::new(bytes);
    let clients = read_count(&mut dec, "client")?;
    for _ in 0..clients {
        let blocks = read_count(&mut dec, "block")?;
        read_u32(&mut dec, "client id")?;
        let mut clock = read_u32(&mut dec, "clock")?;
        for _ in 0..blocks {
            let len = check_block(&mut dec)?;
            clock = clock
                .checked_add(len)
                .ok_or(UpdateCheckError::Overflow("clock"))?;
        }
    }
    check_delete_set(&mut dec)
}

fn read_u32(dec: &mut Decoder<'_>, what: &'static str) -> Result<u32> {
    u32::try_from(dec.read_var_uint()?).map_err(|_| UpdateCheckError::Overflow(what))
}

/// Read an element count. Every element takes at least one byte.
fn read_count(dec: &mut Decoder<'_>, what: &'static str) -> Result<u32> {
    let count = dec.read_var_uint()?;
    let remaining = dec.remaining();
    if count > remaining as u64 {
        return Err(UpdateCheckError::CountTooLarge {
            what,
            count,
            remaining,
        });
    }
    u32::try_from(count).map_err(|_| UpdateCheckError::Overflow(what))
}

fn read_id(dec: &mut Decoder<'_>) -> Result<()> {
    read_u32(dec, "client id")?;
    read_u32(dec, "clock")?;
    Ok(())
}

fn non_empty(len: u32) -> Result<u32> {
    if len == 0 {
        Err(UpdateCheckError::EmptyBlock)
    } else {
        Ok(len)
    }
}

/// Returns the number of clock ticks the block covers.
fn check_block(dec: &mut Decoder<'_>) -> Result<u32> {
    let info = dec.read_u8()?;
    if info == BLOCK_SKIP || info == BLOCK_GC {
        return non_empty(read_u32(dec, "block length")?);
    }

    if info & HAS_ORIGIN != 0 {
        read_id(dec)?;
    }
    if info & HAS_RIGHT_ORIGIN != 0 {
        read_id(dec)?;
    }
    if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
        if read_u32(dec, "parent info")? == 1 {
            dec.read_var_string()?;
        } else {
            read_id(dec)?;
        }
        if info & HAS_PARENT_SUB != 0 {
            dec.read_var_string()?;
        }
    }
    check_content(dec, info & 0b1111)
}

fn check_content(dec: &mut Decoder<'_>, content: u8) -> Result<u32> {
    match content {
        CONTENT_DELETED => non_empty(read_u32(dec, "deleted length")?),
        CONTENT_JSON => {
            // Yrs reads one entry past the declared count.
            let count = read_count(dec, "json entry")?;
            for _ in 0..=count {
                dec.read_var_string()?;
            }
            count
                .checked_add(1)
                .ok_or(UpdateCheckError::Overflow("json entry"))
        }
        CONTENT_BINARY => {
            dec.read_var_u8_array()?;
            Ok(1)
        }
        CONTENT_STRING => {
            let chunk = dec.read_var_string()?;
            u32::try_from(chunk.encode_utf16().count())
                .map_err(|_| UpdateCheckError::Overflow("string length"))
        }
        CONTENT_EMBED => {
            dec.read_var_string()?;
            Ok(1)
        }
        CONTENT_FORMAT => {
            dec.read_var_string()?;
            dec.read_var_string()?;
            Ok(1)
        }
        CONTENT_TYPE => {
            match dec.read_u8()? {
                TYPE_XML_ELEMENT => {
                    dec.read_var_string()?;
                }
                0 | 1 | 2 | 4 | 5 | 6 | 9 | 15 => {}
                other => return Err(UpdateCheckError::UnknownTypeRef(other)),
            }
            Ok(1)
        }
        CONTENT_ANY => {
            let count = read_count(dec, "value")?;
            for _ in 0..count {
                check_value(dec, 0)?;
            }
            Ok(count)
        }
        CONTENT_DOC => {
            dec.read_var_string()?;
            check_value(dec, 0)?;
            Ok(1)
        }
        other => Err(UpdateCheckError::UnknownContent(other)),
    }
}

/// lib0 `Any` encoding.
fn check_value(dec: &mut Decoder<'_>, depth: usize) -> Result<()> {
    if depth > MAX_VALUE_DEPTH {
        return Err(UpdateCheckError::TooDeep);
    }
    match dec.read_u8()? {
        // undefined, null, false, true
        127 | 126 | 121 | 120 => {}
        125 => skip_signed_var(dec)?,
        124 => {
            dec.read_bytes(4)?;
        }
        123 | 122 => {
            dec.read_bytes(8)?;
        }
        119 => {
            dec.read_var_string()?;
        }
        118 => {
            let entries = read_count(dec, "map entry")?;
            for _ in 0..entries {
                dec.read_var_string()?;
                check_value(dec, depth + 1)?;
            }
        }
        117 => {
            let items = read_count(dec, "array item")?;
            for _ in 0..items {
                check_value(dec, depth + 1)?;
            }
        }
        116 => {
            dec.read_var_u8_array()?;
        }
        tag => return Err(UpdateCheckError::UnknownValueTag(tag)),
    }
    Ok(())
}

fn skip_signed_var(dec: &mut Decoder<'_>) -> Result<()> {
    for _ in 0..MAX_SIGNED_VAR_LEN {
        if dec.read_u8()? & 0x80 == 0 {
            return Ok(());
        }
    }
    Err(CodecError::VarIntOverflow.into())
}

fn check_delete_set(dec: &mut Decoder<'_>) -> Result<()> {
    let clients = read_count(dec, "delete set client")?;
    for _ in 0..clients {
        read_u32(dec, "client id")?;
        let ranges = read_count(dec, "delete range")?;
        if ranges == 0 {
            return Err(UpdateCheckError::EmptyDeleteEntry);
        }
        for _ in 0..ranges {
            let clock = read_u32(dec, "delete clock")?;
            let len = read_u32(dec, "delete length")?;
            if len == 0 {
                return Err(UpdateCheckError::EmptyDeleteEntry);
            }
            clock
                .checked_add(len)
                .ok_or(UpdateCheckError::Overflow("delete range"))?;
        }
    }
    Ok(())
}
