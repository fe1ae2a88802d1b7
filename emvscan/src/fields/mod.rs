use crate::bcdutil::{bcd_byte_value, bcd_digits, bcd_to_ascii};
use crate::tlv::{flatten_tlv, parse_tlv, printable_ascii};
use log::trace;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::OnceLock;

pub const PAN_LENGTHS: RangeInclusive<usize> = 13..=19;

/// PCI style truncation for anything that ends up in logs or diagnostics.
pub fn mask_pan(pan: &str) -> String {
    let uncensored_bin_prefix_length = if pan.len() > 15 { 8 } else { 6 };
    let visible_suffix_start = pan.len().saturating_sub(4);

    let truncated_pan: String = pan
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if i >= uncensored_bin_prefix_length.min(visible_suffix_start)
                && i < visible_suffix_start
            {
                '*'
            } else {
                c
            }
        })
        .collect();

    truncated_pan
}

pub fn luhn_valid(digits: &str) -> bool {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let sum: u32 = digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let digit = (b - b'0') as u32;
            if i % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                digit
            }
        })
        .sum();

    sum % 10 == 0
}

fn is_pan_shaped(digits: &str) -> bool {
    PAN_LENGTHS.contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Strict `cn` decode first, cards with stray filler nibbles fall back to the
/// lenient one.
pub fn decode_pan(bytes: &[u8]) -> Option<String> {
    let digits = match bcd_to_ascii(bytes) {
        Some(ascii) => String::from_utf8_lossy(&ascii).into_owned(),
        None => bcd_digits(bytes),
    };
    let pan = digits.trim_start_matches('0');

    if is_pan_shaped(pan) {
        Some(pan.to_string())
    } else {
        trace!("Rejected PAN candidate of {} digits", pan.len());
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Expiry {
    pub month: u8,
    pub year: u16,
}

impl Expiry {
    fn from_parts(month: u8, two_digit_year: u8) -> Option<Expiry> {
        if !(1..=12).contains(&month) || two_digit_year > 99 {
            return None;
        }

        let year = if two_digit_year <= 50 {
            2000 + two_digit_year as u16
        } else {
            1900 + two_digit_year as u16
        };

        Some(Expiry { month, year })
    }

    /// `YYMM` digits as found in Track-2 data.
    pub fn from_yymm(digits: &str) -> Option<Expiry> {
        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let year: u8 = digits[0..2].parse().ok()?;
        let month: u8 = digits[2..4].parse().ok()?;

        Expiry::from_parts(month, year)
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02}/{}", self.month, self.year)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpiryScheme {
    Yymmdd,
    Mmyydd,
    Yymm,
    Mmyy,
}

impl ExpiryScheme {
    // Lower wins when two interpretations are equally plausible
    fn tie_break_rank(self) -> u8 {
        match self {
            ExpiryScheme::Yymmdd => 0,
            ExpiryScheme::Yymm => 1,
            ExpiryScheme::Mmyydd => 2,
            ExpiryScheme::Mmyy => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryCandidate {
    pub expiry: Expiry,
    pub scheme: ExpiryScheme,
}

/// Every plausible reading of a `5F24` style BCD date. Two byte values are
/// ambiguous and may yield both a `YYMM` and a `MMYY` candidate.
pub fn decode_expiry(bytes: &[u8]) -> Vec<ExpiryCandidate> {
    let values: Option<Vec<u8>> = bytes.iter().map(|b| bcd_byte_value(*b)).collect();
    let values = match values {
        Some(values) => values,
        None => return Vec::new(),
    };

    let mut candidates = Vec::new();
    match values.as_slice() {
        [yy, mm, _dd] => {
            if let Some(expiry) = Expiry::from_parts(*mm, *yy) {
                candidates.push(ExpiryCandidate {
                    expiry,
                    scheme: ExpiryScheme::Yymmdd,
                });
            } else if let Some(expiry) = Expiry::from_parts(*yy, *mm) {
                candidates.push(ExpiryCandidate {
                    expiry,
                    scheme: ExpiryScheme::Mmyydd,
                });
            }
        }
        [first, second] => {
            if let Some(expiry) = Expiry::from_parts(*second, *first) {
                candidates.push(ExpiryCandidate {
                    expiry,
                    scheme: ExpiryScheme::Yymm,
                });
            }
            if let Some(expiry) = Expiry::from_parts(*first, *second) {
                candidates.push(ExpiryCandidate {
                    expiry,
                    scheme: ExpiryScheme::Mmyy,
                });
            }
        }
        _ => {}
    }

    candidates
}

fn plausibility(expiry: &Expiry, reference_year: i32) -> i32 {
    let distance = expiry.year as i32 - reference_year;
    match distance {
        0..=10 => 100 - 3 * distance,
        -2..=-1 => 80 + 10 * distance,
        11..=15 => 70 - 5 * (distance - 10),
        _ => 0,
    }
}

/// Picks one expiry out of the candidates: the most plausible year relative
/// to `reference_year` wins, equal scores go to the scheme with the lower
/// tie-break rank (`YYMMDD`, `YYMM`, `MMYYDD`, `MMYY`).
pub fn resolve_expiry(candidates: &[ExpiryCandidate], reference_year: i32) -> Option<Expiry> {
    candidates
        .iter()
        .min_by_key(|c| {
            (
                -plausibility(&c.expiry, reference_year),
                c.scheme.tie_break_rank(),
            )
        })
        .map(|c| c.expiry)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track2 {
    pub primary_account_number: String,
    pub expiry_year: String,
    pub expiry_month: String,
    pub service_code: String,
    pub discretionary_data: String,
}

fn track2_regex() -> Option<&'static Regex> {
    static TRACK2: OnceLock<Option<Regex>> = OnceLock::new();
    TRACK2
        .get_or_init(|| {
            // human readable: ;4321432143214321=2612101123456789123?
            // ICC: 4321432143214321D2612101123456789123F
            Regex::new(
                r"^;?(?P<pan>\d+)F*[D=](?:(?P<yy>\d{2})(?P<mm>\d{2}))?(?P<service>\d{3})?(?P<extra>[0-9A-F]*?)F*\??$",
            )
            .ok()
        })
        .as_ref()
}

impl Track2 {
    pub fn expiry(&self) -> Option<Expiry> {
        Expiry::from_yymm(&format!("{}{}", self.expiry_year, self.expiry_month))
    }

    pub fn censor(&mut self) {
        self.primary_account_number = mask_pan(&self.primary_account_number);
        self.discretionary_data = self.discretionary_data.replace(|_c: char| true, "*");
    }
}

impl fmt::Display for Track2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            ";{}={}{}{}{}?",
            self.primary_account_number,
            self.expiry_year,
            self.expiry_month,
            self.service_code,
            self.discretionary_data
        )
    }
}

pub fn decode_track2(track_data: &str) -> Option<Track2> {
    let normalized: String = track_data
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();

    let cap = track2_regex()?.captures(&normalized)?;
    let group = |name: &str| {
        cap.name(name)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    };

    let pan = group("pan");
    if !is_pan_shaped(&pan) {
        trace!("Track-2 PAN of {} digits rejected", pan.len());
        return None;
    }

    Some(Track2 {
        primary_account_number: pan,
        expiry_year: group("yy"),
        expiry_month: group("mm"),
        service_code: group("service"),
        discretionary_data: group("extra"),
    })
}

/// Track-2 arrives either as ASCII text (`=` separator) or as packed BCD with
/// a `D` separator nibble.
pub fn decode_track2_bytes(bytes: &[u8]) -> Option<Track2> {
    if !bytes.is_empty() && bytes.iter().all(|b| (0x20..=0x7E).contains(b)) {
        if let Some(track2) = decode_track2(&String::from_utf8_lossy(bytes)) {
            return Some(track2);
        }
    }

    decode_track2(&hex::encode_upper(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PanSource {
    Track2,
    Pan,
    Track2Equivalent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardFields {
    pub pan: Option<String>,
    pub pan_source: Option<PanSource>,
    pub track2: Option<Track2>,
    pub expiry_candidates: Vec<ExpiryCandidate>,
    pub cardholder_name: Option<String>,
    pub application_label: Option<String>,
    pub aids: Vec<String>,
    pub aip: Option<Vec<u8>>,
    pub afl: Option<Vec<u8>>,
    pub pdol: Option<Vec<u8>>,
    pub directory_sfi: Option<u8>,
    pub truncated: bool,
}

impl CardFields {
    pub fn expiry(&self, reference_year: i32) -> Option<Expiry> {
        resolve_expiry(&self.expiry_candidates, reference_year)
    }
}

fn non_empty(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Pulls the identity relevant data objects out of one response body.
/// PAN priority is Track-2 (`57`), then `5A`, then Track-2 equivalent (`9F6B`).
pub fn extract_card_fields(response: &[u8]) -> CardFields {
    let mut fields = CardFields::default();
    let mut track2: Option<Track2> = None;
    let mut pan_5a: Option<String> = None;
    let mut track2_equivalent: Option<Track2> = None;
    let mut expiry_5f24: Vec<ExpiryCandidate> = Vec::new();

    // GET PROCESSING OPTIONS format 1: 80 [AIP(2) AFL(4n)]
    if let Some(first) = parse_tlv(response).nodes.first() {
        if first.tag == "80" && first.value.len() >= 2 && (first.value.len() - 2) % 4 == 0 {
            fields.aip = Some(first.value[0..2].to_vec());
            fields.afl = Some(first.value[2..].to_vec());
        }
    }

    let flat = flatten_tlv(response);
    fields.truncated = flat.truncated();

    for node in flat.nodes {
        match node.tag.as_str() {
            "57" if track2.is_none() => track2 = decode_track2_bytes(&node.value),
            "5A" if pan_5a.is_none() => pan_5a = decode_pan(&node.value),
            "9F6B" if track2_equivalent.is_none() => {
                track2_equivalent = decode_track2_bytes(&node.value)
            }
            "5F24" if expiry_5f24.is_empty() => expiry_5f24 = decode_expiry(&node.value),
            "5F20" if fields.cardholder_name.is_none() => {
                fields.cardholder_name = non_empty(printable_ascii(&node.value))
            }
            "50" if fields.application_label.is_none() => {
                fields.application_label = non_empty(printable_ascii(&node.value))
            }
            "4F" if !node.value.is_empty() => {
                let aid = hex::encode_upper(&node.value);
                if !fields.aids.contains(&aid) {
                    fields.aids.push(aid);
                }
            }
            "82" if fields.aip.is_none() => fields.aip = Some(node.value),
            "94" if fields.afl.is_none() => fields.afl = Some(node.value),
            "9F38" if fields.pdol.is_none() => fields.pdol = Some(node.value),
            "88" if fields.directory_sfi.is_none() => {
                fields.directory_sfi = node.value.first().copied()
            }
            _ => {}
        }
    }

    let (pan, source, track) = if let Some(t2) = track2 {
        (Some(t2.primary_account_number.clone()), Some(PanSource::Track2), Some(t2))
    } else if let Some(pan) = pan_5a {
        (Some(pan), Some(PanSource::Pan), None)
    } else if let Some(t2) = track2_equivalent {
        (
            Some(t2.primary_account_number.clone()),
            Some(PanSource::Track2Equivalent),
            Some(t2),
        )
    } else {
        (None, None, None)
    };

    if let Some(expiry) = track.as_ref().and_then(|t| t.expiry()) {
        fields.expiry_candidates.push(ExpiryCandidate {
            expiry,
            scheme: ExpiryScheme::Yymm,
        });
    }
    fields.expiry_candidates.extend(expiry_5f24);
    fields.pan = pan;
    fields.pan_source = source;
    fields.track2 = track;

    fields
}

fn push_unique(candidates: &mut Vec<String>, candidate: String) {
    if !candidates.contains(&candidate) {
        candidates.push(candidate);
    }
}

/// Value of a PAN carrying data object (`5A`, `57`, `9F6B`) found by its tag
/// and length bytes, as nibble offsets into the scanned buffer.
#[derive(Debug, Clone, Copy)]
struct AnchoredValue {
    tag: usize,
    start: usize,
    end: usize,
    separated: bool,
    complete: bool,
}

fn anchored_values(bytes: &[u8]) -> Vec<AnchoredValue> {
    let mut values = Vec::new();

    for i in 0..bytes.len() {
        let (tag_length, separated) = match (bytes[i], bytes.get(i + 1)) {
            (0x5A, _) => (1, false),
            (0x57, _) => (1, true),
            (0x9F, Some(0x6B)) => (2, true),
            _ => continue,
        };
        let length = match bytes.get(i + tag_length) {
            Some(length) if *length > 0 && *length < 0x80 => *length as usize,
            _ => continue,
        };

        let start = i + tag_length + 1;
        let end = (start + length).min(bytes.len());
        if start < end {
            values.push(AnchoredValue {
                tag: i * 2,
                start: start * 2,
                end: end * 2,
                separated,
                complete: start + length <= bytes.len(),
            });
        }
    }

    values
}

// Digits at the front of an anchored value, `None` unless they end where the
// data object says they do: a `D` separator for Track-2, `F` padding or the
// end of the value for `5A`.
fn anchored_digits(nibbles: &[u8], value: &AnchoredValue) -> Option<String> {
    let value_nibbles = &nibbles[value.start..value.end];
    let count = value_nibbles.iter().take_while(|n| **n <= 0x9).count();
    let terminated = match value_nibbles.get(count) {
        Some(0xD) => value.separated,
        Some(0xF) => !value.separated,
        Some(_) => false,
        None => !value.separated && value.complete,
    };

    let digits: String = value_nibbles[..count]
        .iter()
        .map(|n| char::from(b'0' + n))
        .collect();
    (terminated && is_pan_shaped(&digits)).then_some(digits)
}

/// Last resort search for card numbers in raw response bytes: ASCII digit runs
/// of PAN length, and packed BCD digit runs that end in a `D` separator.
pub fn scan_text_for_pan(bytes: &[u8]) -> Vec<String> {
    let mut candidates = Vec::new();

    let mut ascii_run = String::new();
    for b in bytes.iter().chain(std::iter::once(&0u8)) {
        if b.is_ascii_digit() {
            ascii_run.push(char::from(*b));
        } else {
            if PAN_LENGTHS.contains(&ascii_run.len()) {
                push_unique(&mut candidates, ascii_run.clone());
            }
            ascii_run.clear();
        }
    }

    let nibbles: Vec<u8> = bytes.iter().flat_map(|b| [b >> 4, b & 0xF]).collect();
    let anchored = anchored_values(bytes);
    let mut accepted_end = 0;
    for value in &anchored {
        // tag bytes inside an accepted value are card number digits
        if value.tag < accepted_end {
            continue;
        }
        if let Some(digits) = anchored_digits(&nibbles, value) {
            push_unique(&mut candidates, digits);
            accepted_end = value.end;
        }
    }

    // Tag and length bytes in front of packed digits read as digits too, so
    // separators inside an anchored value are left to the pass above.
    let mut bcd_run = String::new();
    for (index, nibble) in nibbles.iter().enumerate() {
        match nibble {
            0x0..=0x9 => bcd_run.push(char::from(b'0' + nibble)),
            0xD => {
                let covered = anchored
                    .iter()
                    .any(|value| value.start <= index && index < value.end);
                if !covered && PAN_LENGTHS.contains(&bcd_run.len()) {
                    push_unique(&mut candidates, bcd_run.clone());
                }
                bcd_run.clear();
            }
            _ => bcd_run.clear(),
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bcdutil::ascii_to_bcd_cn;
    use iso7816_tlv::ber::{Tag, Tlv, Value};
    use std::convert::TryFrom;

    fn primitive(tag: &str, value: &[u8]) -> Tlv {
        Tlv::new(Tag::try_from(tag).unwrap(), Value::Primitive(value.to_vec())).unwrap()
    }

    #[test]
    fn test_luhn() {
        assert!(luhn_valid("4532015112830366"));
        assert!(!luhn_valid("4532015112830367"));
        assert!(!luhn_valid(""));
        assert!(!luhn_valid("4532O15112830366"));
        assert!(luhn_valid("5372288697116366"));
        assert!(!luhn_valid("4220560000002044"));
    }

    #[test]
    fn test_pan_decode_with_padding() {
        for pan in [
            "5372288697116366",
            "4532015112830",
            "6759123456789012345",
            "376011111111117",
        ] {
            let size = (pan.len() + 1) / 2;
            let bcd = ascii_to_bcd_cn(pan.as_bytes(), size).unwrap();
            assert_eq!(decode_pan(&bcd).unwrap(), pan);

            let mut padded = bcd.clone();
            padded.extend([0xFF, 0xFF]);
            assert_eq!(decode_pan(&padded).unwrap(), pan);
        }

        assert_eq!(
            decode_pan(&[0x00, 0x53, 0x72, 0x28, 0x86, 0x97, 0x11, 0x63, 0x66]).unwrap(),
            "5372288697116366"
        );
        assert!(decode_pan(&[0x12, 0x34, 0x56]).is_none());
    }

    #[test]
    fn test_expiry_three_bytes() {
        assert_eq!(
            decode_expiry(&hex::decode("280301").unwrap()),
            [ExpiryCandidate {
                expiry: Expiry { month: 3, year: 2028 },
                scheme: ExpiryScheme::Yymmdd
            }]
        );
        // month 28 is impossible, swapped reading applies
        assert_eq!(
            decode_expiry(&hex::decode("032831").unwrap()),
            [ExpiryCandidate {
                expiry: Expiry { month: 3, year: 2028 },
                scheme: ExpiryScheme::Mmyydd
            }]
        );
        assert!(decode_expiry(&hex::decode("991301").unwrap()).is_empty());
        assert!(decode_expiry(&[0x2A, 0x03, 0x01]).is_empty());
    }

    #[test]
    fn test_expiry_ambiguity_is_surfaced() {
        let candidates = decode_expiry(&[0x03, 0x12]);
        assert_eq!(
            candidates,
            [
                ExpiryCandidate {
                    expiry: Expiry { month: 12, year: 2003 },
                    scheme: ExpiryScheme::Yymm
                },
                ExpiryCandidate {
                    expiry: Expiry { month: 3, year: 2012 },
                    scheme: ExpiryScheme::Mmyy
                },
            ]
        );

        let single = decode_expiry(&[0x28, 0x03]);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].scheme, ExpiryScheme::Yymm);
    }

    #[test]
    fn test_resolve_expiry() {
        // YYMM 12/2003 is seven years stale, MMYY 03/2012 is two years ahead
        let candidates = decode_expiry(&[0x03, 0x12]);
        assert_eq!(
            resolve_expiry(&candidates, 2010),
            Some(Expiry { month: 3, year: 2012 })
        );

        // 09/2008 and 08/2009 are both implausible in 2026, YYMM takes the tie
        let candidates = decode_expiry(&[0x08, 0x09]);
        assert_eq!(
            resolve_expiry(&candidates, 2026),
            Some(Expiry { month: 9, year: 2008 })
        );

        let candidates = decode_expiry(&[0x05, 0x27]);
        assert_eq!(
            resolve_expiry(&candidates, 2026),
            Some(Expiry { month: 5, year: 2027 })
        );

        let mut candidates = decode_expiry(&hex::decode("280331").unwrap());
        candidates.push(ExpiryCandidate {
            expiry: Expiry { month: 3, year: 2028 },
            scheme: ExpiryScheme::Yymm,
        });
        assert_eq!(candidates[0].scheme, ExpiryScheme::Yymmdd);
        assert_eq!(
            resolve_expiry(&candidates, 2026),
            Some(Expiry { month: 3, year: 2028 })
        );

        assert_eq!(resolve_expiry(&[], 2026), None);
    }

    #[test]
    fn test_track2() {
        let track2 = decode_track2("5372288697116366D28032010000000000000F").unwrap();
        assert_eq!(track2.primary_account_number, "5372288697116366");
        assert_eq!(track2.expiry_year, "28");
        assert_eq!(track2.expiry_month, "03");
        assert_eq!(track2.service_code, "201");
        assert_eq!(track2.discretionary_data, "0000000000000");
        assert_eq!(track2.expiry(), Some(Expiry { month: 3, year: 2028 }));

        let readable = decode_track2(";4321432143214321=2612101123456789123?").unwrap();
        assert_eq!(readable.primary_account_number, "4321432143214321");
        assert_eq!(readable.service_code, "101");
        assert_eq!(readable.discretionary_data, "123456789123");

        let padded = decode_track2("537228869711636FFD2803").unwrap();
        assert_eq!(padded.primary_account_number, "537228869711636");
        assert_eq!(padded.service_code, "");

        assert!(decode_track2("12345D2803201").is_none());
        assert!(decode_track2("no separator here").is_none());
    }

    #[test]
    fn test_track2_bytes() {
        let bcd = hex::decode("5372288697116366D28032010000000000000F").unwrap();
        assert_eq!(
            decode_track2_bytes(&bcd).unwrap().primary_account_number,
            "5372288697116366"
        );

        let ascii = b";4321432143214321=2612101123456789123?";
        assert_eq!(
            decode_track2_bytes(ascii).unwrap().primary_account_number,
            "4321432143214321"
        );
    }

    #[test]
    fn test_mask_pan() {
        assert_eq!(mask_pan("5372288697116366"), "53722886****6366");
        assert_eq!(mask_pan("376011111111117"), "376011*****1117");
        assert_eq!(mask_pan("1234"), "1234");
        assert_eq!(mask_pan(""), "");
    }

    #[test]
    fn test_extract_prefers_track2() {
        let mut response = Vec::new();
        let record = Tlv::new(
            Tag::try_from("70").unwrap(),
            Value::Constructed(vec![
                primitive("5A", &hex::decode("4532015112830366").unwrap()),
                primitive(
                    "57",
                    &hex::decode("5372288697116366D28032010000000000000F").unwrap(),
                ),
                primitive("5F24", &hex::decode("280331").unwrap()),
                primitive("5F20", b"DOE/JANE  "),
            ]),
        )
        .unwrap();
        response.extend(record.to_vec());

        let fields = extract_card_fields(&response);
        assert_eq!(fields.pan.as_deref(), Some("5372288697116366"));
        assert_eq!(fields.pan_source, Some(PanSource::Track2));
        assert_eq!(fields.cardholder_name.as_deref(), Some("DOE/JANE"));
        assert_eq!(fields.expiry(2026), Some(Expiry { month: 3, year: 2028 }));
        assert!(!fields.truncated);
    }

    #[test]
    fn test_extract_gpo_format_one() {
        let response = hex::decode("800E1980080101001001010118010200").unwrap();
        let fields = extract_card_fields(&response);
        assert_eq!(fields.aip, Some(vec![0x19, 0x80]));
        assert_eq!(
            fields.afl,
            Some(hex::decode("080101001001010118010200").unwrap())
        );
        assert!(fields.pan.is_none());
    }

    #[test]
    fn test_extract_directory_entries() {
        let fci = hex::decode(
            "6F2F840E325041592E5359532E4444463031A51DBF0C1A61184F07A0000000041010500A4D4153544552434152448701019000",
        )
        .unwrap();
        let fields = extract_card_fields(&fci[..fci.len() - 2]);
        assert_eq!(fields.aids, ["A0000000041010"]);
        assert_eq!(fields.application_label.as_deref(), Some("MASTERCARD"));
    }

    #[test]
    fn test_scan_text_for_pan() {
        let mut record = b"\x70\x14\x9F\x4D\x10".to_vec();
        record.extend(b"4220560000002044");
        assert_eq!(scan_text_for_pan(&record), ["4220560000002044"]);

        // 57 13 prefix digits run into the packed PAN
        let packed = hex::decode("57135372288697116366D2803201").unwrap();
        assert_eq!(scan_text_for_pan(&packed), ["5372288697116366"]);

        assert!(scan_text_for_pan(b"12345 and 1234567890123456789012").is_empty());
    }

    #[test]
    fn test_scan_anchors_on_tag_and_length() {
        // truncated record, 57 11 reads as digits in front of the PAN
        let truncated = hex::decode("57114532015112830366D28032010000000000").unwrap();
        assert_eq!(scan_text_for_pan(&truncated), ["4532015112830366"]);

        let track2 = hex::decode("57124532015112830366D280320100000000000F").unwrap();
        assert_eq!(scan_text_for_pan(&track2), ["4532015112830366"]);

        // odd length PAN, 57 10 plus the digits is itself 19 digits long
        let amex = hex::decode("5710376011111111117D28032010000000000F").unwrap();
        assert_eq!(scan_text_for_pan(&amex), ["376011111111117"]);

        let equivalent = hex::decode("9F6B105372288697116366D2803201000000").unwrap();
        assert_eq!(scan_text_for_pan(&equivalent), ["5372288697116366"]);

        let pan = hex::decode("700A5A084532015112830366").unwrap();
        assert_eq!(scan_text_for_pan(&pan), ["4532015112830366"]);

        // declared eight bytes, six arrived
        let cut = hex::decode("5A08453201511283").unwrap();
        assert!(scan_text_for_pan(&cut).is_empty());

        // no tag in front of an over long run
        let unanchored = hex::decode("12344532015112830366D2803201").unwrap();
        assert!(scan_text_for_pan(&unanchored).is_empty());
    }
}
