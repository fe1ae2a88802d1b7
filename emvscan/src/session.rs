use crate::classifier::CardType;
use crate::fields::{mask_pan, Expiry};
use chrono::Utc;
use openssl::sha;
use rand::prelude::*;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusWord {
    pub sw1: u8,
    pub sw2: u8,
}

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord {
        sw1: 0x90,
        sw2: 0x00,
    };

    pub fn new(sw1: u8, sw2: u8) -> StatusWord {
        StatusWord { sw1, sw2 }
    }

    /// Splits a raw response into its data and trailing status word.
    pub fn split_response(raw: &[u8]) -> Option<(&[u8], StatusWord)> {
        if raw.len() < 2 {
            return None;
        }
        let (data, trailer) = raw.split_at(raw.len() - 2);

        Some((data, StatusWord::new(trailer[0], trailer[1])))
    }

    pub fn is_success(&self) -> bool {
        *self == StatusWord::SUCCESS
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.sw1, self.sw2)
    }
}

/// One physical command/response round trip. `status_word` is absent when the
/// transport never delivered a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApduExchange {
    pub sequence_number: u32,
    pub command: Vec<u8>,
    pub response: Vec<u8>,
    pub status_word: Option<StatusWord>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl ApduExchange {
    pub fn is_success(&self) -> bool {
        self.status_word.map(|sw| sw.is_success()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Recognized,
    PartiallyRecognized,
    Unrecognized,
    TransportError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardReadAttempt {
    pub session_id: String,
    pub started_at: String,
    pub atr: Vec<u8>,
    pub card_fingerprint: String,
    command_log: Vec<ApduExchange>,
    outcome: Option<AttemptOutcome>,
}

pub fn card_fingerprint(atr: &[u8]) -> String {
    hex::encode_upper(&sha::sha256(atr)[..8])
}

fn new_session_id(atr: &[u8]) -> (String, String) {
    let now = Utc::now();

    let mut nonce = [0u8; 16];
    let mut rng = ChaCha20Rng::from_entropy();
    rng.fill(&mut nonce[..]);

    let mut hasher = sha::Sha256::new();
    hasher.update(&now.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    hasher.update(atr);
    hasher.update(&nonce);
    let digest = hasher.finish();

    (
        format!(
            "{}-{}",
            now.format("%Y%m%d%H%M%S"),
            hex::encode(&digest[..4])
        ),
        now.to_rfc3339(),
    )
}

impl CardReadAttempt {
    pub fn new(atr: &[u8]) -> CardReadAttempt {
        let (session_id, started_at) = new_session_id(atr);

        CardReadAttempt {
            session_id,
            started_at,
            atr: atr.to_vec(),
            card_fingerprint: card_fingerprint(atr),
            command_log: Vec::new(),
            outcome: None,
        }
    }

    pub fn command_log(&self) -> &[ApduExchange] {
        &self.command_log
    }

    /// `None` until the attempt has been finalized.
    pub fn outcome(&self) -> Option<AttemptOutcome> {
        self.outcome
    }

    pub fn is_finalized(&self) -> bool {
        self.outcome.is_some()
    }

    pub(crate) fn record(
        &mut self,
        command: &[u8],
        response: &[u8],
        status_word: Option<StatusWord>,
        elapsed: Duration,
        timed_out: bool,
    ) -> Option<&ApduExchange> {
        if self.is_finalized() {
            return None;
        }

        let exchange = ApduExchange {
            sequence_number: self.command_log.len() as u32 + 1,
            command: command.to_vec(),
            response: response.to_vec(),
            status_word,
            elapsed,
            timed_out,
        };
        self.command_log.push(exchange);

        self.command_log.last()
    }

    pub(crate) fn finalize(mut self, outcome: AttemptOutcome) -> CardReadAttempt {
        self.outcome = Some(outcome);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AidFailure {
    pub aid: String,
    pub status_word: Option<StatusWord>,
    pub timed_out: bool,
}

/// What the protocol walk observed, independent of any extracted PAN.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSignals {
    pub pse_success: bool,
    pub pse_aids: Vec<String>,
    pub selected_aid: Option<String>,
    pub aid_failures: Vec<AidFailure>,
    pub gpo_success: bool,
    pub records_read: u32,
    pub luhn_failed_pans: Vec<String>,
    pub truncated_responses: u32,
    pub timeouts: u32,
    pub uid: Option<String>,
}

impl SessionSignals {
    pub fn aid_failed(&self, aid: &str) -> bool {
        self.aid_failures
            .iter()
            .any(|failure| failure.aid.eq_ignore_ascii_case(aid))
    }

    pub fn any_card_response(&self) -> bool {
        self.pse_success || self.selected_aid.is_some() || self.records_read > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CardIdentifier {
    Pan(String),
    Uid(String),
    Atr(String),
}

impl CardIdentifier {
    pub fn from_uid(uid: &[u8]) -> CardIdentifier {
        CardIdentifier::Uid(format!(
            "UID_{}",
            hex::encode_upper(&uid[..uid.len().min(8)])
        ))
    }

    pub fn from_atr(atr: &[u8]) -> CardIdentifier {
        CardIdentifier::Atr(format!(
            "ATR_{}",
            hex::encode_upper(&atr[atr.len().saturating_sub(8)..])
        ))
    }

    pub fn as_str(&self) -> &str {
        match self {
            CardIdentifier::Pan(value) | CardIdentifier::Uid(value) | CardIdentifier::Atr(value) => {
                value
            }
        }
    }

    pub fn censored(&self) -> CardIdentifier {
        match self {
            CardIdentifier::Pan(pan) => CardIdentifier::Pan(mask_pan(pan)),
            other => other.clone(),
        }
    }
}

impl fmt::Display for CardIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionSource {
    PaymentSystemEnvironment,
    ProcessingOptions,
    Record,
    BruteForceRecord,
    GenerateAc,
    GetData,
    LogScan,
    Uid,
    Atr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRecognitionResult {
    pub session_id: String,
    pub identifier: CardIdentifier,
    pub pan: Option<String>,
    pub expiry: Option<Expiry>,
    pub card_type: CardType,
    pub confidence: u8,
    pub auto_approve: bool,
    pub luhn_valid: bool,
    pub selected_aid: Option<String>,
    pub cardholder_name: Option<String>,
    pub source: ExtractionSource,
}

impl CardRecognitionResult {
    pub fn has_pan(&self) -> bool {
        self.pan.is_some()
    }

    /// Copy that is safe to log: masked PAN, no cardholder name.
    pub fn censored(&self) -> CardRecognitionResult {
        let mut censored = self.clone();
        censored.identifier = self.identifier.censored();
        censored.pan = self.pan.as_deref().map(mask_pan);
        censored.cardholder_name = self
            .cardholder_name
            .as_ref()
            .map(|name| name.replace(|_c: char| true, "*"));
        censored
    }
}

impl fmt::Display for CardRecognitionResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} type:{} confidence:{} auto_approve:{} source:{:?}",
            self.identifier, self.card_type, self.confidence, self.auto_approve, self.source
        )?;
        if let Some(expiry) = &self.expiry {
            write!(f, " expiry:{}", expiry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_identity() {
        let atr = hex::decode("3B8F8001804F0CA000000306030001000000006A").unwrap();
        let first = CardReadAttempt::new(&atr);
        let second = CardReadAttempt::new(&atr);

        assert_ne!(first.session_id, second.session_id);
        assert_eq!(first.card_fingerprint, second.card_fingerprint);
        assert_eq!(first.card_fingerprint.len(), 16);

        let (timestamp, digest) = first.session_id.split_once('-').unwrap();
        assert_eq!(timestamp.len(), 14);
        assert_eq!(digest.len(), 8);
    }

    #[test]
    fn test_command_log_is_sequenced_and_frozen() {
        let mut attempt = CardReadAttempt::new(&[0x3B, 0x00]);
        for _ in 0..3 {
            attempt.record(
                &[0x00, 0xA4],
                &[],
                Some(StatusWord::new(0x6A, 0x82)),
                Duration::from_millis(5),
                false,
            );
        }

        let sequence: Vec<u32> = attempt
            .command_log()
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(sequence, [1, 2, 3]);

        let mut attempt = attempt.finalize(AttemptOutcome::Unrecognized);
        assert!(attempt
            .record(&[0x00], &[], None, Duration::ZERO, true)
            .is_none());
        assert_eq!(attempt.command_log().len(), 3);
        assert_eq!(attempt.outcome(), Some(AttemptOutcome::Unrecognized));
    }

    #[test]
    fn test_identifiers() {
        assert_eq!(
            CardIdentifier::from_uid(&[0x04, 0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 0x07, 0x08]).as_str(),
            "UID_04A1B2C3D4E5F607"
        );
        assert_eq!(
            CardIdentifier::from_atr(&hex::decode("3B8F8001804F0CA000000306030001000000006A").unwrap())
                .as_str(),
            "ATR_030001000000006A"
        );
        assert_eq!(
            CardIdentifier::Pan("5372288697116366".to_string()).censored(),
            CardIdentifier::Pan("53722886****6366".to_string())
        );
    }

    #[test]
    fn test_status_word() {
        let (data, sw) = StatusWord::split_response(&[0x01, 0x02, 0x90, 0x00]).unwrap();
        assert_eq!(data, [0x01, 0x02]);
        assert!(sw.is_success());
        assert_eq!(StatusWord::new(0x6A, 0x82).to_string(), "6A82");
        assert!(StatusWord::split_response(&[0x90]).is_none());
    }
}
