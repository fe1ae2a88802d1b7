use crate::classifier::atr_family_hint;
use crate::fields::mask_pan;
use crate::session::{AttemptOutcome, CardReadAttempt, CardRecognitionResult, SessionSignals};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClassification {
    CardNotRecognized,
    PanExtractionFailed,
    LuhnValidationFailed,
    EmvCommunicationError,
    TimeoutError,
    PartialRead,
    Unknown,
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorClassification::CardNotRecognized => "CARD_NOT_RECOGNIZED",
            ErrorClassification::PanExtractionFailed => "PAN_EXTRACTION_FAILED",
            ErrorClassification::LuhnValidationFailed => "LUHN_VALIDATION_FAILED",
            ErrorClassification::EmvCommunicationError => "EMV_COMMUNICATION_ERROR",
            ErrorClassification::TimeoutError => "TIMEOUT_ERROR",
            ErrorClassification::PartialRead => "PARTIAL_READ",
            ErrorClassification::Unknown => "UNKNOWN_ERROR",
        };
        write!(f, "{}", name)
    }
}

/// `None` for a clean read: a PAN that passed the Luhn check.
pub fn classify_attempt(
    attempt: &CardReadAttempt,
    signals: &SessionSignals,
    result: Option<&CardRecognitionResult>,
) -> Option<ErrorClassification> {
    let outcome = match attempt.outcome() {
        Some(outcome) => outcome,
        None => return Some(ErrorClassification::Unknown),
    };

    match outcome {
        AttemptOutcome::Recognized => match result {
            Some(result) if result.luhn_valid => None,
            Some(_) => Some(ErrorClassification::LuhnValidationFailed),
            None => Some(ErrorClassification::Unknown),
        },
        AttemptOutcome::PartiallyRecognized => Some(ErrorClassification::PartialRead),
        AttemptOutcome::TransportError => {
            let timed_out = attempt
                .command_log()
                .last()
                .map(|exchange| exchange.timed_out)
                .unwrap_or(false);
            if timed_out {
                Some(ErrorClassification::TimeoutError)
            } else {
                Some(ErrorClassification::EmvCommunicationError)
            }
        }
        AttemptOutcome::Unrecognized => {
            if !signals.luhn_failed_pans.is_empty() {
                Some(ErrorClassification::LuhnValidationFailed)
            } else if signals.any_card_response() {
                Some(ErrorClassification::PanExtractionFailed)
            } else {
                Some(ErrorClassification::CardNotRecognized)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub classification: ErrorClassification,
    pub confidence: u8,
    pub notes: Vec<String>,
    pub signals: SessionSignals,
    pub result: Option<CardRecognitionResult>,
    pub attempt: CardReadAttempt,
}

impl DiagnosticRecord {
    pub fn new(
        classification: ErrorClassification,
        attempt: CardReadAttempt,
        signals: SessionSignals,
        result: Option<CardRecognitionResult>,
        mut notes: Vec<String>,
    ) -> DiagnosticRecord {
        if let Some(hint) = atr_family_hint(&attempt.atr) {
            notes.push(format!("ATR pattern: {}", hint));
        }
        if signals.truncated_responses > 0 {
            notes.push(format!(
                "{} truncated TLV responses",
                signals.truncated_responses
            ));
        }
        for pan in &signals.luhn_failed_pans {
            notes.push(format!("Luhn check failed for {}", mask_pan(pan)));
        }

        DiagnosticRecord {
            classification,
            confidence: result.as_ref().map(|r| r.confidence).unwrap_or(0),
            notes,
            signals,
            result,
            attempt,
        }
    }

    /// Masks every PAN the record carries outside of the raw command log.
    pub fn censor(&mut self) {
        self.result = self.result.as_ref().map(|r| r.censored());
        self.signals.luhn_failed_pans = self
            .signals
            .luhn_failed_pans
            .iter()
            .map(|pan| mask_pan(pan))
            .collect();
    }
}

/// Receives every attempt that did not end in a clean read. Implementations
/// must return immediately; the next tap waits on this call.
pub trait DiagnosticsSink {
    fn on_attempt_finished(&self, record: DiagnosticRecord);
}

/// Hands records to another thread over a bounded channel, dropping them when
/// the consumer falls behind.
#[derive(Clone)]
pub struct ChannelDiagnostics {
    sender: Sender<DiagnosticRecord>,
}

impl ChannelDiagnostics {
    pub fn bounded(capacity: usize) -> (ChannelDiagnostics, Receiver<DiagnosticRecord>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (ChannelDiagnostics { sender }, receiver)
    }
}

impl DiagnosticsSink for ChannelDiagnostics {
    fn on_attempt_finished(&self, record: DiagnosticRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => warn!(
                "Diagnostics queue full, dropping record for session {}",
                record.attempt.session_id
            ),
            Err(TrySendError::Disconnected(record)) => warn!(
                "Diagnostics consumer gone, dropping record for session {}",
                record.attempt.session_id
            ),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnostics;

impl DiagnosticsSink for LogDiagnostics {
    fn on_attempt_finished(&self, record: DiagnosticRecord) {
        info!(
            "Session {} finished as {} ({} APDUs, confidence {}): {}",
            record.attempt.session_id,
            record.classification,
            record.attempt.command_log().len(),
            record.confidence,
            record.notes.join("; ")
        );
    }
}
