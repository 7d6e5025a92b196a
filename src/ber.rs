// BER tag-length-value codec.
// Parses any BER structure into a node tree and dispatches registered handlers by tag path.
// No protocol semantics live here; controls build their decoders on top of BerParser.

use std::fmt;
use std::io::{Cursor, Read};
use std::str::FromStr;

use crate::error::{LdapError, LdapResult};

pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_ENUMERATED: u8 = 0x0A;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

const CLASS_MASK: u8 = 0xC0;
const CLASS_APPLICATION: u8 = 0x40;
const CLASS_CONTEXT: u8 = 0x80;
const CONSTRUCTED: u8 = 0x20;
const NUMBER_MASK: u8 = 0x1F;

/// Deepest constructed nesting accepted by [`parse`].
pub const MAX_DEPTH: usize = 64;

/// Context-specific tag `[n]`, primitive or constructed.
pub const fn context_tag(n: u8, constructed: bool) -> u8 {
    CLASS_CONTEXT | (n & NUMBER_MASK) | if constructed { CONSTRUCTED } else { 0 }
}

/// One decoded TLV. Constructed nodes carry their parsed children; `value`
/// always holds the raw content octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerNode {
    pub tag: u8,
    pub length: usize,
    pub value: Vec<u8>,
    pub children: Vec<BerNode>,
}

impl BerNode {
    pub fn is_constructed(&self) -> bool {
        self.tag & CONSTRUCTED != 0
    }
}

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn read_byte(&mut self) -> LdapResult<u8> {
        let mut buf = [0u8; 1];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| LdapError::decode("BER truncated: unexpected end of input"))?;
        Ok(buf[0])
    }

    fn read_tag(&mut self) -> LdapResult<u8> {
        let tag = self.read_byte()?;
        if tag & NUMBER_MASK == NUMBER_MASK {
            return Err(LdapError::decode(format!(
                "High tag numbers are not supported (tag byte 0x{:02X})",
                tag
            )));
        }
        Ok(tag)
    }

    fn read_length(&mut self) -> LdapResult<usize> {
        let first_byte = self.read_byte()?;

        if (first_byte & 0x80) == 0 {
            // Short form
            return Ok(first_byte as usize);
        }
        // Long form
        let length_bytes = (first_byte & 0x7F) as usize;
        if length_bytes == 0 {
            return Err(LdapError::decode("Indefinite length not supported"));
        }
        if length_bytes > 4 {
            return Err(LdapError::decode(format!("Length too large: {} bytes", length_bytes)));
        }
        if self.remaining() < length_bytes {
            return Err(LdapError::decode(format!(
                "BER truncated: length encoding needs {} bytes, {} remaining",
                length_bytes,
                self.remaining()
            )));
        }
        let mut length = 0u32;
        for _ in 0..length_bytes {
            length = (length << 8) | self.read_byte()? as u32;
        }
        Ok(length as usize)
    }

    fn read_value(&mut self, length: usize) -> LdapResult<Vec<u8>> {
        if self.remaining() < length {
            return Err(LdapError::decode(format!(
                "BER truncated: value needs {} bytes, {} remaining",
                length,
                self.remaining()
            )));
        }
        let mut buf = vec![0u8; length];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| LdapError::decode("BER truncated: unexpected end of input"))?;
        Ok(buf)
    }

    fn read_node(&mut self, depth: usize) -> LdapResult<BerNode> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;
        let value = self.read_value(length)?;
        let children = if tag & CONSTRUCTED != 0 {
            parse_at(&value, depth + 1)?
        } else {
            Vec::new()
        };
        Ok(BerNode {
            tag,
            length,
            value,
            children,
        })
    }

    fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        let len = self.cursor.get_ref().len();
        len.saturating_sub(pos)
    }
}

/// Parses a buffer holding zero or more consecutive TLVs into a node tree.
pub fn parse(data: &[u8]) -> LdapResult<Vec<BerNode>> {
    parse_at(data, 0)
}

fn parse_at(data: &[u8], depth: usize) -> LdapResult<Vec<BerNode>> {
    if depth > MAX_DEPTH {
        return Err(LdapError::decode(format!(
            "BER nesting too deep: more than {} constructed levels",
            MAX_DEPTH
        )));
    }
    let mut reader = BerReader::new(data);
    let mut nodes = Vec::new();
    while reader.remaining() > 0 {
        nodes.push(reader.read_node(depth)?);
    }
    Ok(nodes)
}

/// Encodes a single TLV.
pub fn encode(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut writer = BerWriter::new();
    writer.write_tagged(tag, value);
    writer.into_vec()
}

fn encode_length(length: usize) -> Vec<u8> {
    if length < 128 {
        // Short form
        return vec![length as u8];
    }
    // Long form
    let mut bytes = Vec::new();
    let mut len = length;
    while len > 0 {
        bytes.push((len & 0xFF) as u8);
        len >>= 8;
    }
    bytes.reverse();
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(0x80 | bytes.len() as u8);
    out.extend_from_slice(&bytes);
    out
}

/// Decodes two's-complement INTEGER / ENUMERATED content octets.
pub fn decode_integer(bytes: &[u8]) -> LdapResult<i64> {
    if bytes.is_empty() {
        return Err(LdapError::decode("Integer has no content octets"));
    }
    if bytes.len() > 8 {
        return Err(LdapError::decode(format!("Integer too large: {} bytes", bytes.len())));
    }
    let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in bytes {
        value = (value << 8) | byte as i64;
    }
    Ok(value)
}

pub fn decode_boolean(bytes: &[u8]) -> LdapResult<bool> {
    match bytes {
        [b] => Ok(*b != 0),
        _ => Err(LdapError::decode(format!(
            "Boolean value must be 1 byte, got: {}",
            bytes.len()
        ))),
    }
}

pub fn decode_string(bytes: &[u8]) -> LdapResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| LdapError::decode("Invalid UTF-8 string"))
}

/// One step of a [`BerPath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSelector {
    Seq,
    Set,
    Int,
    Enum,
    OctStr,
    Bool,
    Null,
    /// Context-specific `[n]`, primitive or constructed.
    Ctx(u8),
    /// Application `[APPLICATION n]`, primitive or constructed.
    App(u8),
}

impl TagSelector {
    pub fn matches(&self, tag: u8) -> bool {
        match *self {
            TagSelector::Seq => tag == TAG_SEQUENCE,
            TagSelector::Set => tag == TAG_SET,
            TagSelector::Int => tag == TAG_INTEGER,
            TagSelector::Enum => tag == TAG_ENUMERATED,
            TagSelector::OctStr => tag == TAG_OCTET_STRING,
            TagSelector::Bool => tag == TAG_BOOLEAN,
            TagSelector::Null => tag == TAG_NULL,
            TagSelector::Ctx(n) => tag & CLASS_MASK == CLASS_CONTEXT && tag & NUMBER_MASK == n,
            TagSelector::App(n) => {
                tag & CLASS_MASK == CLASS_APPLICATION && tag & NUMBER_MASK == n
            }
        }
    }
}

impl fmt::Display for TagSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagSelector::Seq => f.write_str("SEQ"),
            TagSelector::Set => f.write_str("SET"),
            TagSelector::Int => f.write_str("INT"),
            TagSelector::Enum => f.write_str("ENUM"),
            TagSelector::OctStr => f.write_str("OCTSTR"),
            TagSelector::Bool => f.write_str("BOOL"),
            TagSelector::Null => f.write_str("NULL"),
            TagSelector::Ctx(n) => write!(f, "CTX({})", n),
            TagSelector::App(n) => write!(f, "APP({})", n),
        }
    }
}

impl FromStr for TagSelector {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tagged = |prefix: &str| -> Option<LdapResult<u8>> {
            let inner = s.strip_prefix(prefix)?.strip_suffix(')')?;
            Some(
                inner
                    .parse::<u8>()
                    .ok()
                    .filter(|n| *n < NUMBER_MASK)
                    .ok_or_else(|| LdapError::config(format!("Invalid tag number in selector: {}", s))),
            )
        };
        match s {
            "SEQ" => Ok(TagSelector::Seq),
            "SET" => Ok(TagSelector::Set),
            "INT" => Ok(TagSelector::Int),
            "ENUM" => Ok(TagSelector::Enum),
            "OCTSTR" => Ok(TagSelector::OctStr),
            "BOOL" => Ok(TagSelector::Bool),
            "NULL" => Ok(TagSelector::Null),
            _ => {
                if let Some(n) = tagged("CTX(") {
                    return n.map(TagSelector::Ctx);
                }
                if let Some(n) = tagged("APP(") {
                    return n.map(TagSelector::App);
                }
                Err(LdapError::config(format!("Unknown tag selector: {}", s)))
            }
        }
    }
}

/// Address of a node in a BER tree, written as `/SEQ/CTX(1)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerPath(Vec<TagSelector>);

impl BerPath {
    pub fn new(selectors: &[TagSelector]) -> Self {
        Self(selectors.to_vec())
    }

    fn matches(&self, tags: &[u8]) -> bool {
        self.0.len() == tags.len()
            && self.0.iter().zip(tags).all(|(sel, tag)| sel.matches(*tag))
    }
}

impl FromStr for BerPath {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| LdapError::config(format!("BER path must start with '/': {}", s)))?;
        let selectors = rest
            .split('/')
            .map(TagSelector::from_str)
            .collect::<LdapResult<Vec<_>>>()?;
        Ok(Self(selectors))
    }
}

impl fmt::Display for BerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for sel in &self.0 {
            write!(f, "/{}", sel)?;
        }
        Ok(())
    }
}

type Handler<T> = Box<dyn Fn(&mut T, &[u8]) -> LdapResult<()> + Send + Sync>;

/// Depth-first visitor over a BER tree. Every handler whose path matches a
/// visited node receives that node's content octets and the target object.
///
/// A parser holds no per-parse state, so one instance can be shared and used
/// concurrently.
pub struct BerParser<T> {
    handlers: Vec<(BerPath, Handler<T>)>,
}

impl<T> Default for BerParser<T> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }
}

impl<T> BerParser<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler<F>(&mut self, path: BerPath, handler: F) -> &mut Self
    where
        F: Fn(&mut T, &[u8]) -> LdapResult<()> + Send + Sync + 'static,
    {
        self.handlers.push((path, Box::new(handler)));
        self
    }

    pub fn parse(&self, data: &[u8], target: &mut T) -> LdapResult<()> {
        let nodes = parse(data)?;
        let mut tags = Vec::new();
        self.walk(&nodes, &mut tags, target)
    }

    fn walk(&self, nodes: &[BerNode], tags: &mut Vec<u8>, target: &mut T) -> LdapResult<()> {
        for node in nodes {
            tags.push(node.tag);
            for (path, handler) in &self.handlers {
                if path.matches(tags) {
                    handler(target, &node.value)?;
                }
            }
            if node.is_constructed() {
                self.walk(&node.children, tags, target)?;
            }
            tags.pop();
        }
        Ok(())
    }
}

// BER encoding utilities
#[derive(Debug, Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        self.buffer.extend_from_slice(&encode_length(length));
    }

    pub fn write_tagged(&mut self, tag: u8, value: &[u8]) {
        self.write_tag(tag);
        self.write_length(value.len());
        self.buffer.extend_from_slice(value);
    }

    fn integer_octets(value: i64) -> Vec<u8> {
        let bytes = value.to_be_bytes();
        // Drop redundant leading sign octets, keeping the sign bit intact.
        let mut start = 0;
        while start < bytes.len() - 1 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        bytes[start..].to_vec()
    }

    pub fn write_integer(&mut self, value: i64) {
        self.write_tagged(TAG_INTEGER, &Self::integer_octets(value));
    }

    pub fn write_enumerated(&mut self, value: i64) {
        self.write_tagged(TAG_ENUMERATED, &Self::integer_octets(value));
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tagged(TAG_OCTET_STRING, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tagged(TAG_BOOLEAN, &[if value { 0xFF } else { 0x00 }]);
    }

    /// Opens a constructed TLV; content written until [`end_constructed`]
    /// becomes its value.
    ///
    /// [`end_constructed`]: BerWriter::end_constructed
    pub fn start_constructed(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        self.buffer.len()
    }

    /// Back-patches the length of the constructed TLV opened at `content_start`.
    pub fn end_constructed(&mut self, content_start: usize) {
        let content_len = self.buffer.len() - content_start;
        let length = encode_length(content_len);
        self.buffer.splice(content_start..content_start, length);
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(TAG_SEQUENCE)
    }

    pub fn end_sequence(&mut self, content_start: usize) {
        self.end_constructed(content_start)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}
