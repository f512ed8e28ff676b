//! Tagged message trees and their list encoding.
//!
//! A node is flattened into a single list: the tag token, one key and value
//! token per attribute, and finally the content slot. Children go into a
//! nested list holding one list per child, raw data goes in as a single
//! length-prefixed token. The item count parity tells the decoder whether a
//! content slot is present.
//!
//! On the wire a marshalled node carries a one-byte envelope flag in front of
//! the root list. Flag bit [`FLAG_COMPRESSED`] marks an LZ4 compressed body.

use std::fmt;

use bytes::Buf;

use crate::dictionary::Dictionary;
use crate::error::{Error, Result};
use crate::list::{Item, List};
use crate::token::{take_u8, Token};

/// Envelope flag: the body after the flag byte is LZ4 compressed.
pub const FLAG_COMPRESSED: u8 = 0x02;

/// Content slot of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Content {
    /// No content slot on the wire.
    #[default]
    None,
    /// Nested child nodes.
    Children(Vec<Node>),
    /// Opaque payload bytes.
    Data(Vec<u8>),
}

/// A tagged message tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// Element name.
    pub tag: String,
    /// Attributes in wire order.
    pub attrs: Vec<(String, String)>,
    /// Children, data or nothing.
    pub content: Content,
}

impl Node {
    /// Creates a node with no attributes and no content.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            content: Content::None,
        }
    }

    /// Appends an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    /// Sets child nodes as content.
    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.content = Content::Children(children);
        self
    }

    /// Sets raw bytes as content.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.content = Content::Data(data.into());
        self
    }

    /// Returns the first value of an attribute.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the children, or an empty slice when the node has none.
    pub fn children(&self) -> &[Node] {
        match &self.content {
            Content::Children(children) => children,
            _ => &[],
        }
    }

    /// Returns the data payload, if any.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.content {
            Content::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Flattens the node into its list form.
    pub fn to_list(&self, dict: &Dictionary) -> Result<List> {
        let mut list = List::new();
        list.push(Token::from_text(&self.tag, dict)?);
        for (key, value) in &self.attrs {
            list.push(Token::from_text(key, dict)?);
            list.push(Token::from_text(value, dict)?);
        }
        match &self.content {
            Content::None => {}
            Content::Children(children) => {
                let mut nested = List::new();
                for child in children {
                    nested.push(child.to_list(dict)?);
                }
                list.push(nested);
            }
            // Raw data never goes through dictionary lookup.
            Content::Data(data) => list.push(Token::from_bytes(data.clone())?),
        }
        Ok(list)
    }

    /// Rebuilds a node from its list form.
    pub fn from_list(list: &List, dict: &Dictionary) -> Result<Node> {
        let items = list.items();
        let (tag_item, rest) = items
            .split_first()
            .ok_or_else(|| Error::MalformedNode("empty node list".to_string()))?;
        let tag = item_text(tag_item, dict, "tag")?;

        let (attr_items, content_item) = if items.len() % 2 == 0 {
            let (last, attrs) = rest
                .split_last()
                .ok_or_else(|| Error::MalformedNode("missing content slot".to_string()))?;
            (attrs, Some(last))
        } else {
            (rest, None)
        };

        let mut attrs = Vec::with_capacity(attr_items.len() / 2);
        for pair in attr_items.chunks_exact(2) {
            let key = item_text(&pair[0], dict, "attribute key")?;
            let value = item_text(&pair[1], dict, "attribute value")?;
            attrs.push((key, value));
        }

        let content = match content_item {
            None => Content::None,
            Some(Item::List(children)) => {
                let mut nodes = Vec::with_capacity(children.len());
                for child in children.items() {
                    match child {
                        Item::List(child) => nodes.push(Node::from_list(child, dict)?),
                        Item::Token(_) => {
                            return Err(Error::MalformedNode(
                                "child slot holds a token instead of a list".to_string(),
                            ))
                        }
                    }
                }
                Content::Children(nodes)
            }
            Some(Item::Token(token)) => Content::Data(token.clone().into_bytes(dict)?),
        };

        Ok(Node {
            tag,
            attrs,
            content,
        })
    }

    /// Encodes the node as a bare list, without envelope flag.
    pub fn encode(&self, dict: &Dictionary) -> Result<Vec<u8>> {
        self.to_list(dict)?.to_bytes()
    }

    /// Decodes a bare list. Bytes after the root list are rejected.
    pub fn decode(bytes: &[u8], dict: &Dictionary) -> Result<Node> {
        let mut buf = bytes;
        let list = List::read(&mut buf)?;
        if buf.has_remaining() {
            return Err(Error::MalformedNode(format!(
                "{} trailing bytes after root list",
                buf.remaining()
            )));
        }
        Node::from_list(&list, dict)
    }

    /// Encodes the node with an uncompressed envelope.
    pub fn marshal(&self, dict: &Dictionary) -> Result<Vec<u8>> {
        let body = self.encode(dict)?;
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(0);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Encodes the node with an LZ4 compressed envelope.
    pub fn marshal_compressed(&self, dict: &Dictionary) -> Result<Vec<u8>> {
        let body = self.encode(dict)?;
        let compressed = lz4_flex::compress_prepend_size(&body);
        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(FLAG_COMPRESSED);
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Decodes an enveloped node, decompressing when flagged.
    pub fn unmarshal(bytes: &[u8], dict: &Dictionary) -> Result<Node> {
        let mut buf = bytes;
        let flags = take_u8(&mut buf)?;
        if flags & FLAG_COMPRESSED != 0 {
            let body = lz4_flex::decompress_size_prepended(buf)
                .map_err(|e| Error::MalformedNode(format!("decompression failed: {}", e)))?;
            Node::decode(&body, dict)
        } else {
            Node::decode(buf, dict)
        }
    }

    /// Renders an indented, XML-like dump for diagnostics.
    pub fn render_debug_string(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        out.push_str(&indent);
        out.push('<');
        out.push_str(&self.tag);
        for (key, value) in &self.attrs {
            out.push_str(&format!(" {}=\"{}\"", key, value));
        }
        match &self.content {
            Content::None => out.push_str("/>\n"),
            Content::Data(data) => {
                out.push('>');
                match std::str::from_utf8(data) {
                    Ok(text) => out.push_str(text),
                    Err(_) => {
                        for byte in data {
                            out.push_str(&format!("{:02x}", byte));
                        }
                    }
                }
                out.push_str(&format!("</{}>\n", self.tag));
            }
            Content::Children(children) => {
                out.push_str(">\n");
                for child in children {
                    child.render_into(out, depth + 1);
                }
                out.push_str(&format!("{}</{}>\n", indent, self.tag));
            }
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_debug_string())
    }
}

fn item_text(item: &Item, dict: &Dictionary, slot: &str) -> Result<String> {
    match item {
        Item::Token(token) => token.resolve(dict),
        Item::List(_) => Err(Error::MalformedNode(format!("{} is a list", slot))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{LENGTH_STRING_8, SHORT_LIST};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const WORDS: &[&str] = &[
        "",
        "iq",
        "message",
        "s.whatsapp.net",
        "g.us",
        "type",
        "id",
        "to",
        "15551234567@s.whatsapp.net",
        "alice@example.org",
        "no-dictionary-hit",
        "a@b@c",
        "@",
        "héllo wörld",
    ];

    fn random_text(rng: &mut StdRng) -> String {
        if rng.gen_bool(0.7) {
            WORDS[rng.gen_range(0..WORDS.len())].to_string()
        } else {
            let len = rng.gen_range(0..40);
            (0..len)
                .map(|_| rng.gen_range(b'a'..=b'z') as char)
                .collect()
        }
    }

    fn random_node(rng: &mut StdRng, depth: usize) -> Node {
        let mut node = Node::new(random_text(rng));
        for _ in 0..rng.gen_range(0..4) {
            node = node.with_attr(random_text(rng), random_text(rng));
        }
        match rng.gen_range(0..3) {
            0 => node,
            1 => {
                let len = rng.gen_range(0..300);
                let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                node.with_data(data)
            }
            _ if depth < 4 => {
                let count = rng.gen_range(0..5);
                let children = (0..count).map(|_| random_node(rng, depth + 1)).collect();
                node.with_children(children)
            }
            _ => node,
        }
    }

    #[test]
    fn test_random_trees_round_trip() {
        let dict = Dictionary::builtin();
        let mut rng = StdRng::seed_from_u64(0x584D_5050);
        for _ in 0..200 {
            let node = random_node(&mut rng, 0);
            let bytes = node.marshal(&dict).unwrap();
            assert_eq!(Node::unmarshal(&bytes, &dict).unwrap(), node);
        }
    }

    #[test]
    fn test_compressed_round_trip() {
        let dict = Dictionary::builtin();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let node = random_node(&mut rng, 0);
            let bytes = node.marshal_compressed(&dict).unwrap();
            assert_eq!(bytes[0], FLAG_COMPRESSED);
            assert_eq!(Node::unmarshal(&bytes, &dict).unwrap(), node);
        }
    }

    #[test]
    fn test_attribute_order_is_preserved() {
        let dict = Dictionary::builtin();
        let node = Node::new("iq")
            .with_attr("type", "get")
            .with_attr("id", "1")
            .with_attr("to", "s.whatsapp.net");
        let decoded = Node::decode(&node.encode(&dict).unwrap(), &dict).unwrap();
        let keys: Vec<&str> = decoded.attrs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["type", "id", "to"]);
    }

    #[test]
    fn test_parity_decides_content_slot() {
        let dict = Dictionary::builtin();

        let bare = Node::new("iq").with_attr("id", "1");
        let list = bare.to_list(&dict).unwrap();
        assert_eq!(list.len(), 3);

        let with_data = bare.clone().with_data(b"x".to_vec());
        let list = with_data.to_list(&dict).unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(
            Node::from_list(&list, &dict).unwrap().data(),
            Some(&b"x"[..])
        );
    }

    #[test]
    fn test_data_is_never_looked_up() {
        let dict = Dictionary::builtin();
        let node = Node::new("iq").with_data(b"iq".to_vec());
        let bytes = node.encode(&dict).unwrap();
        // tag literal, then data as a length string even though "iq" is a dictionary word
        assert_eq!(&bytes[3..], &[LENGTH_STRING_8, 2, b'i', b'q']);
    }

    #[test]
    fn test_empty_children_round_trip() {
        let dict = Dictionary::builtin();
        let node = Node::new("list").with_children(Vec::new());
        let decoded = Node::decode(&node.encode(&dict).unwrap(), &dict).unwrap();
        assert_eq!(decoded.content, Content::Children(Vec::new()));
    }

    #[test]
    fn test_empty_list_is_malformed() {
        let dict = Dictionary::builtin();
        let err = Node::decode(&[SHORT_LIST, 0], &dict).unwrap_err();
        assert!(matches!(err, Error::MalformedNode(_)));
    }

    #[test]
    fn test_list_in_tag_position_is_malformed() {
        let dict = Dictionary::builtin();
        let err = Node::decode(&[SHORT_LIST, 1, SHORT_LIST, 0], &dict).unwrap_err();
        assert!(matches!(err, Error::MalformedNode(_)));
    }

    #[test]
    fn test_token_in_child_slot_is_malformed() {
        let dict = Dictionary::builtin();
        let bytes = [SHORT_LIST, 2, 0x01, SHORT_LIST, 1, 0x02];
        let err = Node::decode(&bytes, &dict).unwrap_err();
        assert!(matches!(err, Error::MalformedNode(_)));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let dict = Dictionary::builtin();
        let mut bytes = Node::new("iq").marshal(&dict).unwrap();
        bytes.push(0x00);
        let err = Node::unmarshal(&bytes, &dict).unwrap_err();
        assert!(matches!(err, Error::MalformedNode(_)));
    }

    #[test]
    fn test_unmarshal_empty_input_is_truncated() {
        let dict = Dictionary::builtin();
        let err = Node::unmarshal(&[], &dict).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn test_render_debug_string() {
        let node = Node::new("iq")
            .with_attr("type", "get")
            .with_children(vec![Node::new("ping"), Node::new("body").with_data(b"hi".to_vec())]);
        assert_eq!(
            node.render_debug_string(),
            "<iq type=\"get\">\n  <ping/>\n  <body>hi</body>\n</iq>\n"
        );
        assert_eq!(node.to_string(), node.render_debug_string());
    }

    #[test]
    fn test_accessors() {
        let node = Node::new("iq").with_attr("id", "7");
        assert_eq!(node.attr("id"), Some("7"));
        assert_eq!(node.attr("missing"), None);
        assert!(node.children().is_empty());
        assert!(node.data().is_none());
    }
}
