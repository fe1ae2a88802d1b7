use crate::error::TlvError;
use crate::fields::{self, ExpiryCandidate, Track2};
use iso7816_tlv::ber::{Tag, Tlv, Value};
use log::trace;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;

const MAX_TAG_BYTES: usize = 4;
const MAX_LENGTH_BYTES: usize = 4;

// Share of printable bytes needed before an unknown value gets an ASCII annotation
const PRINTABLE_ANNOTATION_THRESHOLD: f32 = 0.75;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvNode {
    pub tag: String,
    pub length: usize,
    pub value: Vec<u8>,
}

impl TlvNode {
    // ref. ISO/IEC 7816-4, 5.2.2.1 BER-TLV tag fields (b6 of the first byte)
    pub fn is_constructed(&self) -> bool {
        u8::from_str_radix(self.tag.get(0..2).unwrap_or("00"), 16)
            .map(|first| first & 0x20 != 0)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvParse {
    pub nodes: Vec<TlvNode>,
    pub truncated: Option<TlvError>,
}

impl TlvParse {
    pub fn truncated(&self) -> bool {
        self.truncated.is_some()
    }
}

pub(crate) fn parse_tag(buf: &[u8], offset: usize) -> Result<(String, usize), TlvError> {
    let first = *buf.get(offset).ok_or(TlvError::TruncatedTag(offset))?;
    let mut end = offset + 1;

    if first & 0x1F == 0x1F {
        loop {
            let next = *buf.get(end).ok_or(TlvError::TruncatedTag(offset))?;
            end += 1;
            if end - offset > MAX_TAG_BYTES {
                return Err(TlvError::TagTooLong(offset));
            }
            if next & 0x80 == 0 {
                break;
            }
        }
    }

    Ok((hex::encode_upper(&buf[offset..end]), end))
}

fn parse_length(buf: &[u8], offset: usize) -> Result<(usize, usize), TlvError> {
    let first = *buf.get(offset).ok_or(TlvError::TruncatedLength(offset))?;

    if first & 0x80 == 0 {
        return Ok((first as usize, offset + 1));
    }

    let count = (first & 0x7F) as usize;
    if count == 0 || count > MAX_LENGTH_BYTES {
        return Err(TlvError::UnsupportedLength(first));
    }

    let length_bytes = buf
        .get(offset + 1..offset + 1 + count)
        .ok_or(TlvError::TruncatedLength(offset))?;
    let length = length_bytes
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize);

    Ok((length, offset + 1 + count))
}

/// Parses the top level BER-TLV objects of `buf`.
///
/// Decoding stops at the first malformed or truncated object; everything parsed
/// before it is kept and the reason is reported in [`TlvParse::truncated`].
pub fn parse_tlv(buf: &[u8]) -> TlvParse {
    let mut result = TlvParse::default();
    let mut offset = 0;

    while offset < buf.len() {
        // ISO/IEC 7816-4 allows 00 filler bytes before, between and after objects
        if buf[offset] == 0x00 {
            offset += 1;
            continue;
        }

        let (tag, value_start) = match parse_tag(buf, offset)
            .and_then(|(tag, next)| parse_length(buf, next).map(|len| (tag, len)))
        {
            Ok((tag, (length, value_start))) => {
                let available = buf.len() - value_start;
                if length > available {
                    result.truncated = Some(TlvError::TruncatedValue {
                        tag,
                        declared: length,
                        available,
                    });
                    break;
                }
                result.nodes.push(TlvNode {
                    tag: tag.clone(),
                    length,
                    value: buf[value_start..value_start + length].to_vec(),
                });
                (tag, value_start + length)
            }
            Err(err) => {
                result.truncated = Some(err);
                break;
            }
        };

        trace!("TLV {} parsed, next offset {}", tag, value_start);
        offset = value_start;
    }

    if let Some(err) = &result.truncated {
        trace!("Could not parse as TLV! error:{}, data: {:02X?}", err, buf);
    }

    result
}

/// Depth-first parse that descends into constructed templates. Constructed
/// nodes are reported before their children.
pub fn flatten_tlv(buf: &[u8]) -> TlvParse {
    let mut top = parse_tlv(buf);
    let mut flat = TlvParse {
        nodes: Vec::with_capacity(top.nodes.len()),
        truncated: top.truncated.take(),
    };

    for node in top.nodes {
        if node.is_constructed() {
            let children = flatten_tlv(&node.value);
            flat.nodes.push(node);
            flat.nodes.extend(children.nodes);
            if flat.truncated.is_none() {
                flat.truncated = children.truncated;
            }
        } else {
            flat.nodes.push(node);
        }
    }

    flat
}

pub fn find_tag(buf: &[u8], tag: &str) -> Option<TlvNode> {
    flatten_tlv(buf)
        .nodes
        .into_iter()
        .find(|node| node.tag.eq_ignore_ascii_case(tag))
}

/// Encodes a primitive data object, e.g. the `83` command template of GET PROCESSING OPTIONS.
pub fn encode_tlv(tag_name: &str, value: &[u8]) -> Option<Vec<u8>> {
    let tag = Tag::try_from(tag_name).ok()?;
    let tlv = Tlv::new(tag, Value::Primitive(value.to_vec())).ok()?;

    Some(tlv.to_vec())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedValue {
    Pan(String),
    Expiry(Vec<ExpiryCandidate>),
    Track2(Track2),
    Text(String),
    Hex { hex: String, ascii: Option<String> },
    Invalid(String),
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodedValue::Pan(pan) => write!(f, "{}", pan),
            DecodedValue::Expiry(candidates) => {
                let rendered: Vec<String> = candidates
                    .iter()
                    .map(|c| format!("{} ({:?})", c.expiry, c.scheme))
                    .collect();
                write!(f, "{}", rendered.join(" | "))
            }
            DecodedValue::Track2(track2) => write!(f, "{}", track2),
            DecodedValue::Text(text) => write!(f, "{:?}", text),
            DecodedValue::Hex { hex, ascii: None } => write!(f, "{}", hex),
            DecodedValue::Hex {
                hex,
                ascii: Some(ascii),
            } => write!(f, "{} ({:?})", hex, ascii),
            DecodedValue::Invalid(hex) => write!(f, "{} (undecodable)", hex),
        }
    }
}

impl DecodedValue {
    /// Card number and cardholder data masked for logging.
    pub fn censored(self) -> DecodedValue {
        match self {
            DecodedValue::Pan(pan) => DecodedValue::Pan(fields::mask_pan(&pan)),
            DecodedValue::Track2(mut track2) => {
                track2.censor();
                DecodedValue::Track2(track2)
            }
            DecodedValue::Text(text) => DecodedValue::Text("*".repeat(text.len())),
            other => other,
        }
    }
}

pub type TagDecoder = fn(&[u8]) -> DecodedValue;

fn decode_pan_value(value: &[u8]) -> DecodedValue {
    match fields::decode_pan(value) {
        Some(pan) => DecodedValue::Pan(pan),
        None => DecodedValue::Invalid(hex::encode_upper(value)),
    }
}

fn decode_expiry_value(value: &[u8]) -> DecodedValue {
    let candidates = fields::decode_expiry(value);
    if candidates.is_empty() {
        return DecodedValue::Invalid(hex::encode_upper(value));
    }

    DecodedValue::Expiry(candidates)
}

fn decode_track2_value(value: &[u8]) -> DecodedValue {
    match fields::decode_track2_bytes(value) {
        Some(track2) => DecodedValue::Track2(track2),
        None => DecodedValue::Invalid(hex::encode_upper(value)),
    }
}

fn decode_printable_value(value: &[u8]) -> DecodedValue {
    DecodedValue::Text(printable_ascii(value))
}

pub fn printable_ascii(value: &[u8]) -> String {
    value
        .iter()
        .filter(|b| (0x20..=0x7E).contains(*b))
        .map(|b| char::from(*b))
        .collect()
}

pub fn decode_unknown_value(value: &[u8]) -> DecodedValue {
    let printable = value.iter().filter(|b| (0x20..=0x7E).contains(*b)).count();
    let ascii = if !value.is_empty()
        && printable as f32 / value.len() as f32 >= PRINTABLE_ANNOTATION_THRESHOLD
    {
        Some(
            value
                .iter()
                .map(|b| {
                    if (0x20..=0x7E).contains(b) {
                        char::from(*b)
                    } else {
                        '.'
                    }
                })
                .collect(),
        )
    } else {
        None
    };

    DecodedValue::Hex {
        hex: hex::encode_upper(value),
        ascii,
    }
}

/// Tag keyed value decoders with a hex/ASCII fallback for unregistered tags.
pub struct DecoderRegistry {
    decoders: HashMap<&'static str, TagDecoder>,
}

impl DecoderRegistry {
    pub fn empty() -> DecoderRegistry {
        DecoderRegistry {
            decoders: HashMap::new(),
        }
    }

    pub fn emv() -> DecoderRegistry {
        let mut registry = DecoderRegistry::empty();
        registry.register("5A", decode_pan_value);
        registry.register("5F24", decode_expiry_value);
        registry.register("57", decode_track2_value);
        registry.register("9F6B", decode_track2_value);
        for tag in ["5F20", "50", "4F", "9F12"] {
            registry.register(tag, decode_printable_value);
        }

        registry
    }

    pub fn register(&mut self, tag: &'static str, decoder: TagDecoder) {
        self.decoders.insert(tag, decoder);
    }

    pub fn decode(&self, tag: &str, value: &[u8]) -> DecodedValue {
        match self.decoders.get(tag.to_uppercase().as_str()) {
            Some(decoder) => decoder(value),
            None => decode_unknown_value(value),
        }
    }

    pub fn decode_node(&self, node: &TlvNode) -> DecodedValue {
        self.decode(&node.tag, &node.value)
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        DecoderRegistry::emv()
    }
}
