//! Lists: ordered sequences of tokens and nested lists.
//!
//! A list is written as a size-class marker, its item count, and then each
//! item in order. Counts below 256 use the short form (`0xF8`, 1 byte count),
//! larger counts the long form (`0xF9`, 2 byte big-endian count).

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::token::{ensure, take_u8, Token, LONG_LIST, MAX_DEPTH, SHORT_LIST};

/// Largest item count of a short list.
pub const MAX_SHORT_LIST: usize = 0xFF;

/// Largest item count of a long list.
pub const MAX_LONG_LIST: usize = 0xFFFF;

/// Size class of a list header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// 1 byte count, marker `0xF8`.
    Short,
    /// 2 byte count, marker `0xF9`.
    Long,
}

impl SizeClass {
    /// Picks the size class for an item count.
    pub fn for_len(len: usize) -> Result<Self> {
        match len {
            0..=MAX_SHORT_LIST => Ok(SizeClass::Short),
            len if len <= MAX_LONG_LIST => Ok(SizeClass::Long),
            len => Err(Error::ListTooLong(len)),
        }
    }

    /// Returns the marker byte for this class.
    pub fn marker(self) -> u8 {
        match self {
            SizeClass::Short => SHORT_LIST,
            SizeClass::Long => LONG_LIST,
        }
    }
}

/// One element of a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// A plain token.
    Token(Token),
    /// A nested list.
    List(List),
}

impl From<Token> for Item {
    fn from(token: Token) -> Self {
        Item::Token(token)
    }
}

impl From<List> for Item {
    fn from(list: List) -> Self {
        Item::List(list)
    }
}

impl Item {
    /// Writes the item to a buffer.
    pub fn write<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Item::Token(token) => token.write(buf),
            Item::List(list) => list.write(buf),
        }
    }

    /// Reads one item, dispatching on its marker.
    pub fn read<B: Buf>(buf: &mut B) -> Result<Item> {
        Item::read_at(buf, 0)
    }

    fn read_at<B: Buf>(buf: &mut B, depth: usize) -> Result<Item> {
        let marker = take_u8(buf)?;
        match marker {
            SHORT_LIST | LONG_LIST => List::read_body(marker, buf, depth).map(Item::List),
            other => Token::read_body(other, buf, depth).map(Item::Token),
        }
    }
}

/// An ordered list of items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct List {
    items: Vec<Item>,
}

impl List {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Creates a list from items.
    pub fn from_items(items: Vec<Item>) -> Self {
        Self { items }
    }

    /// Appends an item.
    pub fn push(&mut self, item: impl Into<Item>) {
        self.items.push(item.into());
    }

    /// Returns the items.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Consumes the list, returning its items.
    pub fn into_items(self) -> Vec<Item> {
        self.items
    }

    /// Returns the number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the size class this list is written with.
    pub fn size_class(&self) -> Result<SizeClass> {
        SizeClass::for_len(self.items.len())
    }

    /// Writes the list header and every item.
    pub fn write<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self.size_class()? {
            SizeClass::Short => {
                buf.put_u8(SHORT_LIST);
                buf.put_u8(self.items.len() as u8);
            }
            SizeClass::Long => {
                buf.put_u8(LONG_LIST);
                buf.put_u16(self.items.len() as u16);
            }
        }
        for item in &self.items {
            item.write(buf)?;
        }
        Ok(())
    }

    /// Encodes the list into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }

    /// Reads a list, marker included.
    pub fn read<B: Buf>(buf: &mut B) -> Result<List> {
        match take_u8(buf)? {
            marker @ (SHORT_LIST | LONG_LIST) => List::read_body(marker, buf, 0),
            other => Err(Error::UnknownMarker(other)),
        }
    }

    fn read_body<B: Buf>(marker: u8, buf: &mut B, depth: usize) -> Result<List> {
        if depth > MAX_DEPTH {
            return Err(Error::MalformedNode("list nesting too deep".to_string()));
        }
        let count = if marker == SHORT_LIST {
            take_u8(buf)? as usize
        } else {
            ensure(buf, 2)?;
            buf.get_u16() as usize
        };

        // Every item takes at least one byte, so a count larger than the
        // remaining input is truncated without allocating for it.
        ensure(buf, count)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(Item::read_at(buf, depth + 1)?);
        }
        Ok(List { items })
    }
}
