use crate::error::{TransportError, WalkAbort};
use crate::session::{CardReadAttempt, StatusWord};
use crate::settings::Settings;
use crate::tlv::encode_tlv;
use crate::transport::CardConnection;
use hexplay::HexViewBuilder;
use log::{debug, trace, warn};
use std::time::{Duration, Instant};

const SW1_BYTES_AVAILABLE: u8 = 0x61;
const SW1_WRONG_LENGTH: u8 = 0x6C;

// response codes: https://www.eftlab.com/knowledge-base/complete-list-of-apdu-responses/
static APDU_STATUS_CODES: [(&str, &str); 16] = [
    ("9000", "Command successfully executed (OK)"),
    ("6283", "Selected file invalidated"),
    ("6700", "Wrong length"),
    ("6981", "Command incompatible with file structure"),
    ("6982", "Security status not satisfied"),
    ("6983", "Authentication method blocked"),
    ("6985", "Conditions of use not satisfied"),
    ("6A81", "Function not supported"),
    ("6A82", "File or application not found"),
    ("6A83", "Record not found"),
    ("6A86", "Incorrect parameters P1-P2"),
    ("6D00", "Instruction code not supported or invalid"),
    ("6E00", "Class not supported"),
    ("61", "Response bytes still available"),
    ("6C", "Wrong length Le"),
    ("63", "State of non-volatile memory changed"),
];

pub fn get_apdu_response_localization(status_word: &StatusWord) -> String {
    let response_status_code = status_word.to_string();

    APDU_STATUS_CODES
        .iter()
        .find(|(code, _)| *code == response_status_code)
        .or_else(|| {
            APDU_STATUS_CODES
                .iter()
                .find(|(code, _)| *code == &response_status_code[0..2])
        })
        .map(|(_, description)| format!("{} - {}", response_status_code, description))
        .unwrap_or(response_status_code)
}

pub fn select_by_name(name: &[u8]) -> Vec<u8> {
    let mut apdu = vec![0x00, 0xA4, 0x04, 0x00, name.len() as u8];
    apdu.extend_from_slice(name);
    apdu.push(0x00);
    apdu
}

pub fn read_record(sfi: u8, record: u8) -> Vec<u8> {
    vec![0x00, 0xB2, record, (sfi << 3) | 4, 0x00]
}

/// `None` sends GET PROCESSING OPTIONS without command data, otherwise the
/// PDOL related data is wrapped in a `83` template.
pub fn get_processing_options(pdol_data: Option<&[u8]>) -> Option<Vec<u8>> {
    let mut apdu = vec![0x80, 0xA8, 0x00, 0x00];

    match pdol_data {
        None => apdu.push(0x00),
        Some(data) => {
            let template = encode_tlv("83", data)?;
            apdu.push(template.len() as u8);
            apdu.extend(template);
            apdu.push(0x00);
        }
    }

    Some(apdu)
}

/// GET DATA style command from a CLA INS P1 P2 header, Le 00.
pub fn get_data(header: &[u8; 4]) -> Vec<u8> {
    let mut apdu = header.to_vec();
    apdu.push(0x00);
    apdu
}

// ref. ISO/IEC 7816-3, 12.1.3 short APDU cases 2 and 4 end with Le
fn ends_with_le(apdu: &[u8]) -> bool {
    match apdu.len() {
        0..=4 => false,
        5 => true,
        len => len == 6 + apdu[4] as usize,
    }
}

pub fn get_response(available_data_length: u8) -> Vec<u8> {
    vec![0x00, 0xC0, 0x00, 0x00, available_data_length]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub status_word: StatusWord,
}

impl ApduResponse {
    pub fn is_success(&self) -> bool {
        self.status_word.is_success()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    Completed(ApduResponse),
    TimedOut,
    /// The card answered with less than a status word.
    Malformed,
}

impl Exchange {
    pub fn status_word(&self) -> Option<StatusWord> {
        match self {
            Exchange::Completed(response) => Some(response.status_word),
            _ => None,
        }
    }

    /// Response data of a `9000` exchange.
    pub fn success_data(&self) -> Option<&[u8]> {
        match self {
            Exchange::Completed(response) if response.is_success() => Some(&response.data),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success_data().is_some()
    }
}

/// Owns the connection for one attempt and records every physical transmit.
pub struct ApduChannel<'a, C: CardConnection> {
    connection: C,
    attempt: CardReadAttempt,
    settings: &'a Settings,
    consecutive_timeouts: u32,
    total_timeouts: u32,
}

impl<'a, C: CardConnection> ApduChannel<'a, C> {
    pub fn new(connection: C, settings: &'a Settings) -> ApduChannel<'a, C> {
        let attempt = CardReadAttempt::new(&connection.atr());

        ApduChannel {
            connection,
            attempt,
            settings,
            consecutive_timeouts: 0,
            total_timeouts: 0,
        }
    }

    pub fn attempt(&self) -> &CardReadAttempt {
        &self.attempt
    }

    pub fn total_timeouts(&self) -> u32 {
        self.total_timeouts
    }

    pub fn into_parts(self) -> (C, CardReadAttempt) {
        (self.connection, self.attempt)
    }

    fn note_timeout(&mut self) -> Result<(), WalkAbort> {
        self.consecutive_timeouts += 1;
        self.total_timeouts += 1;
        warn!(
            "APDU exchange timed out ({} consecutive)",
            self.consecutive_timeouts
        );

        if self.consecutive_timeouts >= self.settings.max_consecutive_timeouts {
            return Err(WalkAbort::TooManyTimeouts(self.consecutive_timeouts));
        }

        Ok(())
    }

    // One physical round trip, `None` if it timed out
    fn transmit(&mut self, apdu: &[u8]) -> Result<Option<Vec<u8>>, WalkAbort> {
        debug!(
            "Sending APDU: {:02X?}... ({} bytes)",
            &apdu[0..apdu.len().min(5)],
            apdu.len()
        );
        if !self.settings.censor_sensitive_fields {
            trace!("APDU:\n{}", HexViewBuilder::new(apdu).finish());
        }

        let started = Instant::now();
        let result = self.connection.transmit(apdu);
        let elapsed = started.elapsed();

        match result {
            Ok(raw) => {
                let split = StatusWord::split_response(&raw);
                let (data, status_word) = match split {
                    Some((data, sw)) => (data, Some(sw)),
                    None => (&raw[..], None),
                };
                let timed_out = elapsed > self.settings.apdu_timeout();
                self.attempt
                    .record(apdu, data, status_word, elapsed, timed_out);

                if timed_out {
                    warn!(
                        "APDU answered after {} ms, limit is {} ms",
                        elapsed.as_millis(),
                        self.settings.apdu_timeout_ms
                    );
                    self.note_timeout()?;
                    return Ok(None);
                }

                self.consecutive_timeouts = 0;
                Ok(Some(raw))
            }
            Err(TransportError::Timeout) => {
                self.attempt.record(apdu, &[], None, elapsed, true);
                self.note_timeout()?;
                Ok(None)
            }
            Err(TransportError::CardRemoved) | Err(TransportError::NoCard) => {
                self.attempt.record(apdu, &[], None, elapsed, false);
                warn!("Card removed during the session");
                Err(WalkAbort::CardRemoved)
            }
            Err(TransportError::Communication(message)) => {
                self.attempt.record(apdu, &[], None, elapsed, false);
                warn!("Reader communication failed: {}", message);
                Err(WalkAbort::Communication(message))
            }
        }
    }

    /// Sends a command and follows `61xx` with GET RESPONSE and `6Cxx` by
    /// re-issuing with the corrected Le.
    pub fn send(&mut self, apdu: &[u8]) -> Result<Exchange, WalkAbort> {
        let mut response_data: Vec<u8> = Vec::new();
        let mut last_status = None;
        let mut apdu_command = apdu.to_vec();

        for _ in 0..=self.settings.max_response_chain {
            let raw = match self.transmit(&apdu_command)? {
                Some(raw) => raw,
                None => return Ok(Exchange::TimedOut),
            };

            let (chunk, status_word) = match StatusWord::split_response(&raw) {
                Some(split) => split,
                None => {
                    warn!("APDU response without status word: {:02X?}", raw);
                    return Ok(Exchange::Malformed);
                }
            };
            response_data.extend_from_slice(chunk);
            last_status = Some(status_word);

            debug!(
                "APDU response status: {}",
                get_apdu_response_localization(&status_word)
            );

            if status_word.sw1 == SW1_BYTES_AVAILABLE {
                let mut available_data_length = status_word.sw2;
                if available_data_length == 0x00 {
                    // there are more than 255 bytes available, query the maximum
                    available_data_length = 0xFF;
                }
                apdu_command = get_response(available_data_length);
            } else if status_word.sw1 == SW1_WRONG_LENGTH
                && status_word.sw2 > 0x00
                && ends_with_le(apdu)
            {
                apdu_command = apdu.to_vec();
                if let Some(le) = apdu_command.last_mut() {
                    *le = status_word.sw2;
                }
            } else {
                break;
            }
        }

        let status_word = match last_status {
            Some(status_word) => status_word,
            None => return Ok(Exchange::Malformed),
        };

        debug!("APDU response({} bytes)", response_data.len());
        if !self.settings.censor_sensitive_fields {
            trace!(
                "APDU response:\n{}",
                HexViewBuilder::new(&response_data).finish()
            );
        }

        Ok(Exchange::Completed(ApduResponse {
            data: response_data,
            status_word,
        }))
    }

    /// Round trip time of every exchange logged after the first `logged` ones.
    pub fn elapsed_since(&self, logged: usize) -> Duration {
        self.attempt
            .command_log()
            .iter()
            .skip(logged)
            .map(|exchange| exchange.elapsed)
            .sum()
    }
}
