use crate::bcdutil;
use crate::error::TlvError;
use crate::settings::Terminal;
use crate::tlv::parse_tag;
use chrono::{Datelike, Timelike, Utc};
use log::{debug, warn};
use rand::prelude::*;
use rand_chacha::ChaCha20Rng;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataObject {
    pub tag: String,
    pub length: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataObjectList {
    data_objects: Vec<DataObject>,
}

impl fmt::Display for DataObjectList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for data_object in &self.data_objects {
            write!(f, "{} ({}b); ", data_object.tag, data_object.length)?;
        }

        Ok(())
    }
}

// EMV Book 3, 5.4 Rules for Using a Data Object List (DOL)
impl DataObjectList {
    pub fn parse(tag_list: &[u8]) -> Result<DataObjectList, TlvError> {
        let mut dol = DataObjectList::default();

        let mut i = 0;
        while i < tag_list.len() {
            let (tag, length_offset) = parse_tag(tag_list, i)?;
            let length = *tag_list
                .get(length_offset)
                .ok_or(TlvError::TruncatedLength(length_offset))?;

            dol.data_objects.push(DataObject {
                tag,
                length: length as usize,
            });
            i = length_offset + 1;
        }

        Ok(dol)
    }

    pub fn has_tag(&self, tag_name: &str) -> bool {
        self.data_objects.iter().any(|d| d.tag == tag_name)
    }

    pub fn is_empty(&self) -> bool {
        self.data_objects.is_empty()
    }

    /// Concatenated values for the listed objects; unknown tags are zero filled.
    pub fn get_tag_list_tag_values(&self, terminal_data: &TerminalData) -> Vec<u8> {
        let mut output: Vec<u8> = Vec::new();

        for data_object in &self.data_objects {
            let mut value = match terminal_data.get(&data_object.tag) {
                Some(value) => value.to_vec(),
                None => {
                    debug!(
                        "tag {:?} has no value, filling with zeros",
                        data_object.tag
                    );
                    vec![0; data_object.length]
                }
            };

            if value.len() != data_object.length {
                warn!(
                    "tag {:?} value length {:02X} does not match tag list value length {:02X}",
                    data_object.tag,
                    value.len(),
                    data_object.length
                );
                value.resize(data_object.length, 0x00);
            }

            output.extend_from_slice(&value);
        }

        output
    }
}

/// Terminal side data object values for one session.
pub struct TerminalData {
    tags: BTreeMap<String, Vec<u8>>,
}

impl TerminalData {
    pub fn new(terminal: &Terminal) -> TerminalData {
        let mut tags: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        for (tag_name, tag_value) in terminal.default_tags.iter() {
            match hex::decode(tag_value) {
                Ok(value) => {
                    tags.insert(tag_name.to_uppercase(), value);
                }
                Err(e) => warn!("Ignoring default tag {}: {}", tag_name, e),
            }
        }

        let now = Utc::now().naive_utc();
        if !tags.contains_key("9A") {
            let today = now.date();
            let transaction_date_ascii_yymmdd = format!(
                "{:02}{:02}{:02}",
                today.year() % 100,
                today.month(),
                today.day()
            );
            if let Some(date) =
                bcdutil::ascii_to_bcd_n(transaction_date_ascii_yymmdd.as_bytes(), 3)
            {
                tags.insert("9A".to_string(), date);
            }
        }

        if !tags.contains_key("9F21") {
            let time = now.time();
            let transaction_time_ascii_hhmmss =
                format!("{:02}{:02}{:02}", time.hour(), time.minute(), time.second());
            if let Some(time) =
                bcdutil::ascii_to_bcd_n(transaction_time_ascii_hhmmss.as_bytes(), 3)
            {
                tags.insert("9F21".to_string(), time);
            }
        }

        if !tags.contains_key("9F37") {
            let mut unpredictable_number = vec![0u8; 4];
            if terminal.use_random {
                let mut rng = ChaCha20Rng::from_entropy();
                rng.fill(&mut unpredictable_number[..]);
            }
            tags.insert("9F37".to_string(), unpredictable_number);
        }

        TerminalData { tags }
    }

    pub fn get(&self, tag_name: &str) -> Option<&[u8]> {
        self.tags.get(tag_name).map(|v| &v[..])
    }
}
