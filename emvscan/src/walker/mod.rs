//! Card protocol walk: a fixed sequence of phases, each trying a bounded set of
//! candidates, from the payment system directory down to raw identifiers.
//!
//! Phase handlers only ever see the walk state and the APDU channel. Transport
//! aborts are the only errors; everything a card refuses is a value.

pub mod candidates;

use crate::apdu::{self, ApduChannel, Exchange};
use crate::classifier::{classify, known_card, CardType};
use crate::diagnostics::{classify_attempt, DiagnosticRecord, DiagnosticsSink};
use crate::dol::{DataObjectList, TerminalData};
use crate::emitter::ResultEmitter;
use crate::error::{TransportError, WalkAbort};
use crate::fields::{
    extract_card_fields, luhn_valid, mask_pan, resolve_expiry, scan_text_for_pan, CardFields,
    Expiry, ExpiryCandidate,
};
use crate::hints::SessionHintCache;
use crate::session::{
    AidFailure, AttemptOutcome, CardIdentifier, CardReadAttempt, CardRecognitionResult,
    ExtractionSource, SessionSignals, StatusWord,
};
use crate::settings::Settings;
use crate::tlv::{encode_tlv, find_tag, flatten_tlv, DecoderRegistry};
use crate::transport::{CardConnection, CardReader};
use candidates::{
    brute_force_grid, default_aid_order, payment_system_directories, GpoVariant,
    ATR_MIN_LENGTH, GENERATE_AC_TEMPLATES, GET_DATA_PROBES, GPO_VARIANTS, UID_COMMANDS,
    UID_MIN_LENGTH,
};
use chrono::{Datelike, Utc};
use log::{debug, info, log_enabled, trace, warn, Level};
use std::collections::VecDeque;
use std::time::Duration;

const SW_FILE_NOT_FOUND: StatusWord = StatusWord {
    sw1: 0x6A,
    sw2: 0x82,
};
const UID_SUCCESS_SW1: [u8; 3] = [0x90, 0x91, 0x61];
const UID_CONFIDENCE: u8 = 30;
const ATR_CONFIDENCE: u8 = 10;
const PSE_DEFAULT_SFI: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordReadMode {
    AflDriven,
    BruteForce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PseSelect,
    AidIteration,
    Gpo,
    RecordRead(RecordReadMode),
    GenerateAcProbe,
    GetDataProbe,
    LogScan,
    UidFallback,
    AtrFallback,
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identification {
    Pan {
        pan: String,
        source: ExtractionSource,
    },
    Uid(Vec<u8>),
    Atr(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Next(Phase),
    Found(Identification),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    Success {
        aid: String,
        fci: Vec<u8>,
        elapsed: Duration,
    },
    Failure {
        aid: String,
        status_word: Option<StatusWord>,
        timed_out: bool,
    },
}

/// One Application File Locator entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AflEntry {
    pub sfi: u8,
    pub start_record: u8,
    pub end_record: u8,
    pub offline_records: u8,
}

impl AflEntry {
    pub fn is_readable(&self) -> bool {
        self.start_record != 0 && self.end_record >= self.start_record
    }
}

pub fn decode_afl(afl: &[u8]) -> Vec<AflEntry> {
    if afl.len() % 4 != 0 {
        warn!("AFL length {} is not a multiple of 4", afl.len());
    }

    afl.chunks_exact(4)
        .map(|entry| AflEntry {
            sfi: entry[0] >> 3,
            start_record: entry[1],
            end_record: entry[2],
            offline_records: entry[3],
        })
        .collect()
}

/// Everything one walk accumulates between phases.
struct WalkState<'a> {
    settings: &'a Settings,
    terminal_data: TerminalData,
    reference_year: i32,
    signals: SessionSignals,
    default_order: Vec<String>,
    aid_queue: VecDeque<String>,
    pdol: Option<Vec<u8>>,
    afl: Option<Vec<u8>>,
    select_elapsed: Option<Duration>,
    brute_forced: bool,
    expiry_candidates: Vec<ExpiryCandidate>,
    // read from the response that carried the PAN
    pan_expiry: Option<Expiry>,
    cardholder_name: Option<String>,
    decoders: DecoderRegistry,
}

impl<'a> WalkState<'a> {
    fn new(settings: &'a Settings, default_order: Vec<String>) -> WalkState<'a> {
        WalkState {
            settings,
            terminal_data: TerminalData::new(&settings.terminal),
            reference_year: Utc::now().year(),
            signals: SessionSignals::default(),
            default_order,
            aid_queue: VecDeque::new(),
            pdol: None,
            afl: None,
            select_elapsed: None,
            brute_forced: false,
            expiry_candidates: Vec::new(),
            pan_expiry: None,
            cardholder_name: None,
            decoders: DecoderRegistry::emv(),
        }
    }

    fn absorb(&mut self, response: &[u8]) -> CardFields {
        if log_enabled!(Level::Trace) {
            self.trace_decoded(response);
        }

        let fields = extract_card_fields(response);
        if fields.truncated {
            self.signals.truncated_responses += 1;
        }
        for candidate in &fields.expiry_candidates {
            if !self.expiry_candidates.contains(candidate) {
                self.expiry_candidates.push(*candidate);
            }
        }
        if self.cardholder_name.is_none() {
            self.cardholder_name = fields.cardholder_name.clone();
        }

        fields
    }

    fn trace_decoded(&self, response: &[u8]) {
        for node in flatten_tlv(response).nodes {
            if node.is_constructed() {
                continue;
            }

            let decoded = self.decoders.decode_node(&node);
            let decoded = if self.settings.censor_sensitive_fields {
                decoded.censored()
            } else {
                decoded
            };
            trace!("{} ({} bytes): {}", node.tag, node.length, decoded);
        }
    }

    fn pan_found(&mut self, fields: &CardFields, source: ExtractionSource) -> Option<Step> {
        let pan = fields.pan.clone()?;
        if !luhn_valid(&pan) {
            self.note_luhn_failure(&pan);
        }
        info!("PAN found by {:?} from {:?}", source, fields.pan_source);
        self.pan_expiry = fields
            .track2
            .as_ref()
            .and_then(|track2| track2.expiry())
            .or_else(|| fields.expiry(self.reference_year));

        Some(Step::Found(Identification::Pan { pan, source }))
    }

    fn note_luhn_failure(&mut self, pan: &str) {
        if !self.signals.luhn_failed_pans.iter().any(|p| p == pan) {
            self.signals.luhn_failed_pans.push(pan.to_string());
        }
    }

    /// AIDs listed by the card go first, then the (hinted) default order.
    fn queue_candidates(&mut self) {
        let mut queue: VecDeque<String> = VecDeque::new();
        for aid in self.signals.pse_aids.iter().chain(self.default_order.iter()) {
            if !queue.iter().any(|queued| queued.eq_ignore_ascii_case(aid)) {
                queue.push_back(aid.to_uppercase());
            }
        }
        self.aid_queue = queue;
    }
}

fn select_application<C: CardConnection>(
    channel: &mut ApduChannel<C>,
    aid: &str,
) -> Result<SelectOutcome, WalkAbort> {
    let name = match hex::decode(aid) {
        Ok(name) => name,
        Err(e) => {
            warn!("Skipping malformed AID {}: {}", aid, e);
            return Ok(SelectOutcome::Failure {
                aid: aid.to_string(),
                status_word: None,
                timed_out: false,
            });
        }
    };

    let logged = channel.attempt().command_log().len();
    let exchange = channel.send(&apdu::select_by_name(&name))?;
    let elapsed = channel.elapsed_since(logged);

    Ok(match exchange {
        Exchange::Completed(response) if response.is_success() => SelectOutcome::Success {
            aid: aid.to_string(),
            fci: response.data,
            elapsed,
        },
        other => SelectOutcome::Failure {
            aid: aid.to_string(),
            status_word: other.status_word(),
            timed_out: other == Exchange::TimedOut,
        },
    })
}

fn pse_select<C: CardConnection>(
    state: &mut WalkState,
    channel: &mut ApduChannel<C>,
) -> Result<Step, WalkAbort> {
    for name in payment_system_directories(state.settings.contactless) {
        let directory = String::from_utf8_lossy(name);
        let exchange = channel.send(&apdu::select_by_name(name))?;
        let fci = match exchange.success_data() {
            Some(fci) => fci.to_vec(),
            None => {
                debug!("Could not select {}", directory);
                continue;
            }
        };

        info!("Selected payment system directory {}", directory);
        state.signals.pse_success = true;

        let fields = state.absorb(&fci);
        collect_directory_aids(state, &fields);
        if let Some(found) = state.pan_found(&fields, ExtractionSource::PaymentSystemEnvironment) {
            return Ok(found);
        }

        let sfi = fields
            .directory_sfi
            .filter(|sfi| (1..=30).contains(sfi))
            .unwrap_or(PSE_DEFAULT_SFI);
        for record in 1..=state.settings.pse_max_records {
            let exchange = channel.send(&apdu::read_record(sfi, record))?;
            let data = match exchange.success_data() {
                Some(data) => data.to_vec(),
                None => break,
            };
            state.signals.records_read += 1;

            let fields = state.absorb(&data);
            collect_directory_aids(state, &fields);
            if let Some(found) =
                state.pan_found(&fields, ExtractionSource::PaymentSystemEnvironment)
            {
                return Ok(found);
            }
        }
    }

    if !state.signals.pse_aids.is_empty() {
        info!("Directory lists {:?}", state.signals.pse_aids);
    }
    state.queue_candidates();

    Ok(Step::Next(Phase::AidIteration))
}

fn collect_directory_aids(state: &mut WalkState, fields: &CardFields) {
    for aid in &fields.aids {
        if !state.signals.pse_aids.contains(aid) {
            state.signals.pse_aids.push(aid.clone());
        }
    }
}

fn aid_iteration<C: CardConnection>(
    state: &mut WalkState,
    channel: &mut ApduChannel<C>,
) -> Result<Step, WalkAbort> {
    while let Some(aid) = state.aid_queue.pop_front() {
        match select_application(channel, &aid)? {
            SelectOutcome::Success { aid, fci, elapsed } => {
                info!("Selected application {}", aid);
                let fields = state.absorb(&fci);
                state.pdol = fields.pdol;
                state.afl = None;
                state.select_elapsed = Some(elapsed);
                state.signals.selected_aid = Some(aid);

                return Ok(Step::Next(Phase::Gpo));
            }
            SelectOutcome::Failure {
                aid,
                status_word,
                timed_out,
            } => {
                trace!(
                    "Application {} not selected: {}",
                    aid,
                    status_word
                        .map(|sw| apdu::get_apdu_response_localization(&sw))
                        .unwrap_or_else(|| "no response".to_string())
                );
                state.signals.aid_failures.push(AidFailure {
                    aid,
                    status_word,
                    timed_out,
                });
            }
        }
    }

    debug!(
        "Application candidates exhausted, {} refused",
        state.signals.aid_failures.len()
    );

    Ok(Step::Next(Phase::LogScan))
}

fn gpo_command(
    variant: GpoVariant,
    pdol: Option<&[u8]>,
    terminal_data: &TerminalData,
) -> Option<Vec<u8>> {
    match variant {
        GpoVariant::Pdol => {
            let pdol = pdol.filter(|pdol| !pdol.is_empty())?;
            let data_object_list = match DataObjectList::parse(pdol) {
                Ok(data_object_list) => data_object_list,
                Err(e) => {
                    warn!("Unusable PDOL: {}", e);
                    return None;
                }
            };
            trace!("PDOL: {}", data_object_list);
            apdu::get_processing_options(Some(
                &data_object_list.get_tag_list_tag_values(terminal_data),
            ))
        }
        GpoVariant::Standard => apdu::get_processing_options(Some(&[])),
        GpoVariant::Empty => apdu::get_processing_options(None),
        GpoVariant::Extended => apdu::get_processing_options(Some(&[0x00, 0x00])),
    }
}

fn gpo<C: CardConnection>(
    state: &mut WalkState,
    channel: &mut ApduChannel<C>,
) -> Result<Step, WalkAbort> {
    for variant in GPO_VARIANTS {
        let command = match gpo_command(variant, state.pdol.as_deref(), &state.terminal_data) {
            Some(command) => command,
            None => continue,
        };

        let exchange = channel.send(&command)?;
        let data = match exchange.success_data() {
            Some(data) => data.to_vec(),
            None => {
                debug!("GET PROCESSING OPTIONS ({:?}) refused", variant);
                continue;
            }
        };
        debug!("GET PROCESSING OPTIONS accepted with {:?}", variant);
        state.signals.gpo_success = true;

        let fields = state.absorb(&data);
        if let Some(found) = state.pan_found(&fields, ExtractionSource::ProcessingOptions) {
            return Ok(found);
        }

        state.afl = fields.afl.filter(|afl| !afl.is_empty());
        let mode = if state.afl.is_some() {
            RecordReadMode::AflDriven
        } else {
            RecordReadMode::BruteForce
        };
        return Ok(Step::Next(Phase::RecordRead(mode)));
    }

    Ok(Step::Next(Phase::RecordRead(RecordReadMode::BruteForce)))
}

fn record_read<C: CardConnection>(
    state: &mut WalkState,
    channel: &mut ApduChannel<C>,
    mode: RecordReadMode,
) -> Result<Step, WalkAbort> {
    match mode {
        RecordReadMode::AflDriven => {
            let entries = decode_afl(state.afl.as_deref().unwrap_or_default());
            for entry in entries {
                if !entry.is_readable() {
                    debug!("Skipping AFL entry {:?}", entry);
                    continue;
                }

                for record in entry.start_record..=entry.end_record {
                    let exchange = channel.send(&apdu::read_record(entry.sfi, record))?;
                    if let Some(data) = exchange.success_data() {
                        state.signals.records_read += 1;
                        let fields = state.absorb(data);
                        if let Some(found) = state.pan_found(&fields, ExtractionSource::Record) {
                            return Ok(found);
                        }
                    }
                }
            }

            Ok(Step::Next(Phase::RecordRead(RecordReadMode::BruteForce)))
        }
        RecordReadMode::BruteForce => {
            if state.brute_forced {
                return Ok(Step::Next(Phase::GenerateAcProbe));
            }
            state.brute_forced = true;

            let mut missing_files: Vec<u8> = Vec::new();
            let grid = brute_force_grid(
                state.settings.brute_force.max_sfi,
                state.settings.brute_force.max_record,
            );
            for (sfi, record) in grid {
                if missing_files.contains(&sfi) {
                    continue;
                }

                let exchange = channel.send(&apdu::read_record(sfi, record))?;
                match exchange.success_data() {
                    Some(data) => {
                        state.signals.records_read += 1;
                        let fields = state.absorb(data);
                        if let Some(found) =
                            state.pan_found(&fields, ExtractionSource::BruteForceRecord)
                        {
                            return Ok(found);
                        }
                    }
                    None if exchange.status_word() == Some(SW_FILE_NOT_FOUND) => {
                        missing_files.push(sfi)
                    }
                    None => {}
                }
            }

            Ok(Step::Next(Phase::GenerateAcProbe))
        }
    }
}

// Only provokes a response carrying card data; the cryptogram is discarded.
fn generate_ac_probe<C: CardConnection>(
    state: &mut WalkState,
    channel: &mut ApduChannel<C>,
) -> Result<Step, WalkAbort> {
    for template in GENERATE_AC_TEMPLATES {
        let command = match hex::decode(template) {
            Ok(command) => command,
            Err(e) => {
                warn!("Bad GENERATE AC template {}: {}", template, e);
                continue;
            }
        };

        let exchange = channel.send(&command)?;
        if let Some(data) = exchange.success_data() {
            let fields = state.absorb(data);
            if let Some(found) = state.pan_found(&fields, ExtractionSource::GenerateAc) {
                return Ok(found);
            }
        }
    }

    Ok(Step::Next(Phase::GetDataProbe))
}

fn get_data_probe<C: CardConnection>(
    state: &mut WalkState,
    channel: &mut ApduChannel<C>,
) -> Result<Step, WalkAbort> {
    for (header, tag) in GET_DATA_PROBES {
        let exchange = channel.send(&apdu::get_data(&header))?;
        let data = match exchange.success_data() {
            Some(data) if !data.is_empty() => data.to_vec(),
            _ => continue,
        };

        // some cards answer with the bare value
        let body = if find_tag(&data, tag).is_some() {
            data
        } else {
            encode_tlv(tag, &data).unwrap_or(data)
        };

        let fields = state.absorb(&body);
        if let Some(found) = state.pan_found(&fields, ExtractionSource::GetData) {
            return Ok(found);
        }
    }

    Ok(Step::Next(Phase::AidIteration))
}

fn log_scan(state: &mut WalkState, attempt: &CardReadAttempt) -> Step {
    let mut accepted: Option<String> = None;

    for exchange in attempt.command_log() {
        for candidate in scan_text_for_pan(&exchange.response) {
            if luhn_valid(&candidate) {
                accepted.get_or_insert(candidate);
            } else {
                state.note_luhn_failure(&candidate);
                if known_card(&candidate).is_some() {
                    accepted.get_or_insert(candidate);
                }
            }
        }
    }

    match accepted {
        Some(pan) => {
            info!(
                "PAN found in raw responses of exchange log: {}",
                if state.settings.censor_sensitive_fields {
                    mask_pan(&pan)
                } else {
                    pan.clone()
                }
            );
            Step::Found(Identification::Pan {
                pan,
                source: ExtractionSource::LogScan,
            })
        }
        None => Step::Next(Phase::UidFallback),
    }
}

fn uid_fallback<C: CardConnection>(
    state: &mut WalkState,
    channel: &mut ApduChannel<C>,
) -> Result<Step, WalkAbort> {
    for command in UID_COMMANDS {
        if let Exchange::Completed(response) = channel.send(command)? {
            if UID_SUCCESS_SW1.contains(&response.status_word.sw1)
                && response.data.len() >= UID_MIN_LENGTH
            {
                info!("Card UID read ({} bytes)", response.data.len());
                state.signals.uid = Some(hex::encode_upper(&response.data));
                return Ok(Step::Found(Identification::Uid(response.data)));
            }
        }
    }

    Ok(Step::Next(Phase::AtrFallback))
}

fn atr_fallback(attempt: &CardReadAttempt) -> Step {
    if attempt.atr.len() >= ATR_MIN_LENGTH {
        Step::Found(Identification::Atr(attempt.atr.clone()))
    } else {
        Step::Next(Phase::Terminal)
    }
}

fn walk<C: CardConnection>(
    state: &mut WalkState,
    channel: &mut ApduChannel<C>,
) -> Result<Option<Identification>, WalkAbort> {
    let mut phase = Phase::PseSelect;

    loop {
        trace!("Phase {:?}", phase);
        let step = match phase {
            Phase::PseSelect => pse_select(state, channel)?,
            Phase::AidIteration => aid_iteration(state, channel)?,
            Phase::Gpo => gpo(state, channel)?,
            Phase::RecordRead(mode) => record_read(state, channel, mode)?,
            Phase::GenerateAcProbe => generate_ac_probe(state, channel)?,
            Phase::GetDataProbe => get_data_probe(state, channel)?,
            Phase::LogScan => log_scan(state, channel.attempt()),
            Phase::UidFallback => uid_fallback(state, channel)?,
            Phase::AtrFallback => atr_fallback(channel.attempt()),
            Phase::Terminal => return Ok(None),
        };

        match step {
            Step::Next(next) => phase = next,
            Step::Found(identification) => return Ok(Some(identification)),
        }
    }
}

/// What one tap produced. The attempt is finalized.
#[derive(Debug, Clone)]
pub struct TapOutcome {
    pub attempt: CardReadAttempt,
    pub signals: SessionSignals,
    pub result: Option<CardRecognitionResult>,
}

pub struct ProtocolWalker<'a> {
    settings: &'a Settings,
    hints: &'a mut dyn SessionHintCache,
    diagnostics: &'a dyn DiagnosticsSink,
    emitter: &'a dyn ResultEmitter,
}

impl<'a> ProtocolWalker<'a> {
    pub fn new(
        settings: &'a Settings,
        hints: &'a mut dyn SessionHintCache,
        diagnostics: &'a dyn DiagnosticsSink,
        emitter: &'a dyn ResultEmitter,
    ) -> ProtocolWalker<'a> {
        ProtocolWalker {
            settings,
            hints,
            diagnostics,
            emitter,
        }
    }

    /// Runs one card session. `Ok(None)` when there is no card in the field.
    pub fn process_tap<R: CardReader>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<TapOutcome>, TransportError> {
        let connection = match reader.connect() {
            Ok(connection) => connection,
            Err(TransportError::NoCard) => {
                trace!("No card present");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut channel = ApduChannel::new(connection, self.settings);
        let fingerprint = channel.attempt().card_fingerprint.clone();
        info!(
            "Card session {} started, ATR {}",
            channel.attempt().session_id,
            hex::encode_upper(&channel.attempt().atr)
        );

        let default_order = self
            .hints
            .get_optimized_candidate_order(&fingerprint, &default_aid_order());
        let mut state = WalkState::new(self.settings, default_order);

        let walked = walk(&mut state, &mut channel);
        state.signals.timeouts = channel.total_timeouts();
        let (connection, attempt) = channel.into_parts();
        connection.disconnect();

        let mut notes = Vec::new();
        let (outcome, result) = match walked {
            Ok(Some(identification)) => {
                let result = self.recognize(&state, &attempt, identification);
                let outcome = if result.has_pan() {
                    AttemptOutcome::Recognized
                } else {
                    AttemptOutcome::PartiallyRecognized
                };
                (outcome, Some(result))
            }
            Ok(None) => (AttemptOutcome::Unrecognized, None),
            Err(abort) => {
                warn!("Card session {} aborted: {}", attempt.session_id, abort);
                notes.push(format!("Walk aborted: {}", abort));
                (AttemptOutcome::TransportError, None)
            }
        };
        let attempt = attempt.finalize(outcome);
        info!(
            "Card session {} finished as {:?} after {} APDUs",
            attempt.session_id,
            outcome,
            attempt.command_log().len()
        );

        if let Some(result) = &result {
            self.emitter.on_card_recognized(result);

            if let (Some(aid), Some(elapsed)) = (&state.signals.selected_aid, state.select_elapsed)
            {
                self.hints
                    .record_success(&fingerprint, aid, result.card_type, elapsed);
            }
        }

        if let Some(classification) = classify_attempt(&attempt, &state.signals, result.as_ref()) {
            let mut record = DiagnosticRecord::new(
                classification,
                attempt.clone(),
                state.signals.clone(),
                result.clone(),
                notes,
            );
            if self.settings.censor_sensitive_fields {
                record.censor();
            }
            self.diagnostics.on_attempt_finished(record);
        }

        Ok(Some(TapOutcome {
            attempt,
            signals: state.signals,
            result,
        }))
    }

    fn recognize(
        &self,
        state: &WalkState,
        attempt: &CardReadAttempt,
        identification: Identification,
    ) -> CardRecognitionResult {
        let signals = &state.signals;

        match identification {
            Identification::Pan { pan, source } => {
                let classification = classify(&pan, signals);
                CardRecognitionResult {
                    session_id: attempt.session_id.clone(),
                    identifier: CardIdentifier::Pan(pan.clone()),
                    pan: Some(pan),
                    expiry: state.pan_expiry.or_else(|| {
                        resolve_expiry(&state.expiry_candidates, state.reference_year)
                    }),
                    card_type: classification.card_type,
                    confidence: classification.confidence,
                    auto_approve: classification.auto_approve,
                    luhn_valid: classification.luhn_valid,
                    selected_aid: signals.selected_aid.clone(),
                    cardholder_name: state.cardholder_name.clone(),
                    source,
                }
            }
            Identification::Uid(uid) => raw_identifier(
                attempt,
                signals,
                CardIdentifier::from_uid(&uid),
                UID_CONFIDENCE,
                ExtractionSource::Uid,
            ),
            Identification::Atr(atr) => raw_identifier(
                attempt,
                signals,
                CardIdentifier::from_atr(&atr),
                ATR_CONFIDENCE,
                ExtractionSource::Atr,
            ),
        }
    }

}

// Many cards share one ATR, so nothing but the PAN tells the card type.
fn raw_identifier(
    attempt: &CardReadAttempt,
    signals: &SessionSignals,
    identifier: CardIdentifier,
    confidence: u8,
    source: ExtractionSource,
) -> CardRecognitionResult {
    CardRecognitionResult {
        session_id: attempt.session_id.clone(),
        identifier,
        pan: None,
        expiry: None,
        card_type: CardType::Unknown,
        confidence,
        auto_approve: false,
        luhn_valid: false,
        selected_aid: signals.selected_aid.clone(),
        cardholder_name: None,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ErrorClassification;
    use crate::fields::Expiry;
    use crate::hints::{MemoryHintCache, NoHints};
    use crate::session::card_fingerprint;
    use crate::transport::testing::{
        ApduRequestResponse, DummyCardReader, ScriptedFailure, TestCard,
    };
    use log::LevelFilter;
    use log4rs::append::console::ConsoleAppender;
    use log4rs::config::{Appender, Config, Root};
    use std::cell::RefCell;
    use std::sync::Once;

    static LOGGING: Once = Once::new();

    fn init_logging() {
        LOGGING.call_once(|| {
            let stdout: ConsoleAppender = ConsoleAppender::builder().build();
            let config = Config::builder()
                .appender(Appender::builder().build("stdout", Box::new(stdout)))
                .build(Root::builder().appender("stdout").build(LevelFilter::Trace))
                .unwrap();
            log4rs::init_config(config).unwrap();
        });
    }

    #[derive(Default)]
    struct CollectingEmitter {
        results: RefCell<Vec<CardRecognitionResult>>,
    }

    impl ResultEmitter for CollectingEmitter {
        fn on_card_recognized(&self, result: &CardRecognitionResult) {
            self.results.borrow_mut().push(result.clone());
        }
    }

    #[derive(Default)]
    struct CollectingDiagnostics {
        records: RefCell<Vec<DiagnosticRecord>>,
    }

    impl DiagnosticsSink for CollectingDiagnostics {
        fn on_attempt_finished(&self, record: DiagnosticRecord) {
            self.records.borrow_mut().push(record);
        }
    }

    fn exchange(req: &str, res: &str) -> ApduRequestResponse {
        ApduRequestResponse {
            req: req.to_string(),
            res: res.to_string(),
            error: None,
        }
    }

    fn failing(req: &str, failure: ScriptedFailure) -> ApduRequestResponse {
        ApduRequestResponse {
            req: req.to_string(),
            res: String::new(),
            error: Some(failure),
        }
    }

    fn card(atr: &str, exchanges: Vec<ApduRequestResponse>) -> DummyCardReader {
        DummyCardReader::with_card(Some(TestCard {
            atr: atr.to_string(),
            exchanges,
        }))
    }

    struct Tap {
        outcome: Option<TapOutcome>,
        emitted: Vec<CardRecognitionResult>,
        diagnostics: Vec<DiagnosticRecord>,
    }

    fn run_tap(reader: &mut DummyCardReader, hints: &mut dyn SessionHintCache) -> Tap {
        init_logging();

        let settings = Settings::default();
        let emitter = CollectingEmitter::default();
        let diagnostics = CollectingDiagnostics::default();

        let outcome = ProtocolWalker::new(&settings, hints, &diagnostics, &emitter)
            .process_tap(reader)
            .unwrap();

        Tap {
            outcome,
            emitted: emitter.results.into_inner(),
            diagnostics: diagnostics.records.into_inner(),
        }
    }

    fn commands(outcome: &TapOutcome) -> Vec<String> {
        outcome
            .attempt
            .command_log()
            .iter()
            .map(|e| hex::encode_upper(&e.command))
            .collect()
    }

    #[test]
    fn test_afl_decode() {
        let entries = decode_afl(&[0x02, 0x01, 0x03, 0x00, 0x10, 0x01, 0x02, 0x01]);
        assert_eq!(
            entries[0],
            AflEntry {
                sfi: 0,
                start_record: 1,
                end_record: 3,
                offline_records: 0
            }
        );
        assert_eq!(entries[1].sfi, 2);
        assert!(entries.iter().all(|e| e.is_readable()));

        let skipped = decode_afl(&[0x08, 0x00, 0x01, 0x00, 0x08, 0x03, 0x02, 0x00, 0x08]);
        assert_eq!(skipped.len(), 2);
        assert!(skipped.iter().all(|e| !e.is_readable()));
    }

    #[test]
    fn test_gpo_commands() {
        let terminal_data = TerminalData::new(&Settings::default().terminal);
        let pdol = [0x9F, 0x66, 0x04];

        assert_eq!(
            gpo_command(GpoVariant::Pdol, Some(&pdol), &terminal_data).unwrap(),
            hex::decode("80A800000683043600400000").unwrap()
        );
        assert_eq!(gpo_command(GpoVariant::Pdol, None, &terminal_data), None);
        assert_eq!(
            gpo_command(GpoVariant::Standard, None, &terminal_data).unwrap(),
            hex::decode("80A8000002830000").unwrap()
        );
        assert_eq!(
            gpo_command(GpoVariant::Empty, None, &terminal_data).unwrap(),
            hex::decode("80A8000000").unwrap()
        );
        assert_eq!(
            gpo_command(GpoVariant::Extended, None, &terminal_data).unwrap(),
            hex::decode("80A80000048302000000").unwrap()
        );
    }

    #[test]
    fn test_track2_from_processing_options() {
        let mut reader = DummyCardReader::from_file("test_data/scenario_a.yaml");
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        assert_eq!(outcome.attempt.outcome(), Some(AttemptOutcome::Recognized));

        let result = outcome.result.clone().unwrap();
        assert_eq!(result.pan.as_deref(), Some("5372288697116366"));
        assert_eq!(result.expiry, Some(Expiry { month: 3, year: 2028 }));
        assert_eq!(result.card_type, CardType::Mastercard);
        assert!(!result.auto_approve);
        assert!(result.luhn_valid);
        assert_eq!(result.source, ExtractionSource::ProcessingOptions);
        assert_eq!(result.selected_aid.as_deref(), Some("A0000000041010"));

        assert_eq!(tap.emitted.len(), 1);
        assert!(tap.diagnostics.is_empty());
        assert!(*reader.disconnected.borrow());
        assert_eq!(reader.sent_count(), outcome.attempt.command_log().len());
        assert_eq!(
            commands(&outcome).last().map(|c| c.as_str()),
            Some("80A8000002830000")
        );
    }

    #[test]
    fn test_pan_in_directory_text_of_restricted_card() {
        let mut reader = DummyCardReader::from_file("test_data/scenario_b.yaml");
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        let result = outcome.result.unwrap();
        assert_eq!(result.pan.as_deref(), Some("4220560000002044"));
        assert_eq!(result.source, ExtractionSource::LogScan);
        assert_eq!(result.card_type, CardType::Visa);
        assert!(result.confidence >= 70);
        assert!(result.auto_approve);
        assert!(!result.luhn_valid);

        assert_eq!(outcome.signals.aid_failures.len(), default_aid_order().len());
        assert!(outcome.signals.pse_success);
        assert_eq!(outcome.attempt.command_log().len(), 4 + default_aid_order().len());

        assert_eq!(tap.emitted.len(), 1);
        assert_eq!(tap.diagnostics.len(), 1);
        let record = &tap.diagnostics[0];
        assert_eq!(
            record.classification,
            ErrorClassification::LuhnValidationFailed
        );
        assert_eq!(
            record.result.as_ref().and_then(|r| r.pan.as_deref()),
            Some("42205600****2044")
        );
    }

    #[test]
    fn test_no_card_in_field() {
        let mut reader = DummyCardReader::empty();
        let tap = run_tap(&mut reader, &mut NoHints);

        assert!(tap.outcome.is_none());
        assert_eq!(reader.sent_count(), 0);
        assert!(tap.emitted.is_empty());
        assert!(tap.diagnostics.is_empty());
    }

    #[test]
    fn test_pdol_gpo_and_afl_records() {
        let mut reader = card(
            "3B 8A 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 90 00",
            vec![
                exchange(
                    "00 A4 04 00 07 A0 00 00 00 03 10 10 00",
                    "6F 11 84 07 A0 00 00 00 03 10 10 A5 06 9F 38 03 9F 66 04 90 00",
                ),
                exchange("80 A8 00 00 06 83 04 36 00 40 00 00", "80 06 00 80 10 01 01 00 90 00"),
                exchange(
                    "00 B2 01 14 00",
                    "70 10 5A 08 45 32 01 51 12 83 03 66 5F 24 03 28 12 31 90 00",
                ),
            ],
        );
        let mut hints = MemoryHintCache::new(10);
        let tap = run_tap(&mut reader, &mut hints);

        let outcome = tap.outcome.unwrap();
        let result = outcome.result.unwrap();
        assert_eq!(result.pan.as_deref(), Some("4532015112830366"));
        assert_eq!(result.source, ExtractionSource::Record);
        assert_eq!(result.expiry, Some(Expiry { month: 12, year: 2028 }));
        assert_eq!(result.card_type, CardType::Visa);
        // prefix table, selected AID, Luhn
        assert_eq!(result.confidence, 80);
        assert!(outcome.signals.gpo_success);
        assert!(tap.diagnostics.is_empty());

        let fingerprint = &outcome.attempt.card_fingerprint;
        assert_eq!(
            hints.get_optimized_candidate_order(fingerprint, &default_aid_order())[0],
            "A0000000031010"
        );
    }

    #[test]
    fn test_brute_force_starts_at_sfi_2_record_1() {
        let mut reader = card(
            "3B 8F 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 00 6A",
            vec![
                exchange(
                    "00 A4 04 00 07 A0 00 00 00 04 10 10 00",
                    "6F 09 84 07 A0 00 00 00 04 10 10 90 00",
                ),
                exchange("80 A8 00 00 02 83 00 00", "77 04 82 02 00 80 90 00"),
                exchange(
                    "00 B2 01 14 00",
                    "70 15 57 13 53 72 28 86 97 11 63 66 D2 80 32 01 00 00 00 00 00 00 0F 90 00",
                ),
            ],
        );
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        let sent = commands(&outcome);
        let gpo = sent.iter().position(|c| c == "80A8000002830000").unwrap();
        assert_eq!(sent[gpo + 1], "00B2011400");
        assert_eq!(
            outcome.result.unwrap().source,
            ExtractionSource::BruteForceRecord
        );
    }

    #[test]
    fn test_bare_get_data_response() {
        let mut reader = card(
            "3B 8F 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 00 6A",
            vec![
                exchange(
                    "00 A4 04 00 07 A0 00 00 00 04 10 10 00",
                    "6F 09 84 07 A0 00 00 00 04 10 10 90 00",
                ),
                exchange("80 CA 5A 00 00", "45 32 01 51 12 83 03 66 90 00"),
            ],
        );
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        let sent = commands(&outcome);
        assert_eq!(sent.iter().filter(|c| c.starts_with("80AE")).count(), 4);
        // every SFI answers file not found, so one read each
        assert_eq!(sent.iter().filter(|c| c.starts_with("00B2")).count(), 11);

        let result = outcome.result.unwrap();
        assert_eq!(result.pan.as_deref(), Some("4532015112830366"));
        assert_eq!(result.source, ExtractionSource::GetData);
    }

    #[test]
    fn test_directory_aids_are_tried_first() {
        let mut reader = card(
            "3B 8A 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 90 00",
            vec![
                exchange(
                    "00 A4 04 00 0E 32 50 41 59 2E 53 59 53 2E 44 44 46 30 31 00",
                    "6F 20 84 0E 32 50 41 59 2E 53 59 53 2E 44 44 46 30 31 \
                     A5 0E BF 0C 0B 61 09 4F 07 A0 00 00 00 03 10 10 90 00",
                ),
                exchange(
                    "00 A4 04 00 07 A0 00 00 00 03 10 10 00",
                    "6F 09 84 07 A0 00 00 00 03 10 10 90 00",
                ),
                exchange(
                    "80 A8 00 00 02 83 00 00",
                    "77 12 57 10 45 32 01 51 12 83 03 66 D2 81 22 01 00 00 00 0F 90 00",
                ),
            ],
        );
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        assert!(outcome.signals.pse_success);
        assert_eq!(outcome.signals.pse_aids, ["A0000000031010"]);
        assert!(outcome.signals.aid_failures.is_empty());

        let sent = commands(&outcome);
        let first_application = sent.iter().find(|c| c.starts_with("00A4040007")).unwrap();
        assert_eq!(first_application, "00A4040007A000000003101000");

        let result = outcome.result.unwrap();
        assert_eq!(result.source, ExtractionSource::ProcessingOptions);
        assert_eq!(result.selected_aid.as_deref(), Some("A0000000031010"));
        assert_eq!(result.expiry, Some(Expiry { month: 12, year: 2028 }));
    }

    #[test]
    fn test_pan_in_directory_record_ends_the_walk() {
        let mut reader = card(
            "3B 8A 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 90 00",
            vec![
                exchange(
                    "00 A4 04 00 0E 32 50 41 59 2E 53 59 53 2E 44 44 46 30 31 00",
                    "6F 15 84 0E 32 50 41 59 2E 53 59 53 2E 44 44 46 30 31 A5 03 88 01 02 90 00",
                ),
                // directory SFI 2 from tag 88
                exchange(
                    "00 B2 01 14 00",
                    "70 0A 5A 08 45 32 01 51 12 83 03 66 90 00",
                ),
            ],
        );
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        assert_eq!(
            commands(&outcome),
            [
                "00A404000E325041592E5359532E444446303100",
                "00B2011400"
            ]
        );
        assert_eq!(outcome.signals.records_read, 1);

        let result = outcome.result.unwrap();
        assert_eq!(result.pan.as_deref(), Some("4532015112830366"));
        assert_eq!(result.source, ExtractionSource::PaymentSystemEnvironment);
        assert_eq!(result.selected_aid, None);
    }

    #[test]
    fn test_pan_from_generate_ac_response() {
        let mut reader = card(
            "3B 8A 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 90 00",
            vec![
                exchange(
                    "00 A4 04 00 07 A0 00 00 00 04 10 10 00",
                    "6F 09 84 07 A0 00 00 00 04 10 10 90 00",
                ),
                exchange(
                    "80 AE 40 00 1B*",
                    "77 0A 5A 08 53 72 28 86 97 11 63 66 90 00",
                ),
            ],
        );
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        assert!(!outcome.signals.gpo_success);
        let sent = commands(&outcome);
        assert_eq!(sent.iter().filter(|c| c.starts_with("80AE")).count(), 1);
        assert!(sent.iter().all(|c| !c.starts_with("80CA")));

        let result = outcome.result.unwrap();
        assert_eq!(result.pan.as_deref(), Some("5372288697116366"));
        assert_eq!(result.source, ExtractionSource::GenerateAc);
        assert_eq!(result.card_type, CardType::Mastercard);
    }

    #[test]
    fn test_pan_recovered_from_truncated_track2() {
        let mut reader = card(
            "3B 8A 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 90 00",
            vec![
                exchange(
                    "00 A4 04 00 07 A0 00 00 00 04 10 10 00",
                    "6F 09 84 07 A0 00 00 00 04 10 10 90 00",
                ),
                // template declares 0x30 bytes, 19 arrive
                exchange(
                    "80 A8 00 00 02 83 00 00",
                    "77 30 57 11 45 32 01 51 12 83 03 66 D2 80 32 01 00 00 00 00 00 90 00",
                ),
            ],
        );
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        assert!(outcome.signals.truncated_responses >= 1);

        let result = outcome.result.unwrap();
        assert_eq!(result.pan.as_deref(), Some("4532015112830366"));
        assert_eq!(result.source, ExtractionSource::LogScan);
        assert!(result.luhn_valid);
        assert_eq!(result.card_type, CardType::Visa);
    }

    #[test]
    fn test_expiry_comes_with_the_pan() {
        let mut reader = card(
            "3B 8A 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 90 00",
            vec![
                // 5F24 of 01/2029 in the FCI would win the tie-break over Track-2
                exchange(
                    "00 A4 04 00 07 A0 00 00 00 04 10 10 00",
                    "6F 11 84 07 A0 00 00 00 04 10 10 A5 06 5F 24 03 29 01 31 90 00",
                ),
                exchange(
                    "80 A8 00 00 02 83 00 00",
                    "77 15 57 13 53 72 28 86 97 11 63 66 D2 80 32 01 00 00 00 00 00 00 0F 90 00",
                ),
            ],
        );
        let tap = run_tap(&mut reader, &mut NoHints);

        let result = tap.outcome.unwrap().result.unwrap();
        assert_eq!(result.source, ExtractionSource::ProcessingOptions);
        assert_eq!(result.expiry, Some(Expiry { month: 3, year: 2028 }));
    }

    #[test]
    fn test_timed_out_select_moves_on_to_uid() {
        let mut reader = card(
            "3B 8A 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 90 00",
            vec![
                failing("00 A4 04 00 07 A0 00 00 00 04 10 10 00", ScriptedFailure::Timeout),
                exchange("FF CA 00 00 00", "04 A1 B2 C3 90 00"),
            ],
        );
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        assert_eq!(
            outcome.attempt.outcome(),
            Some(AttemptOutcome::PartiallyRecognized)
        );
        assert_eq!(
            outcome.signals.aid_failures[0],
            AidFailure {
                aid: "A0000000041010".to_string(),
                status_word: None,
                timed_out: true,
            }
        );
        assert_eq!(outcome.signals.timeouts, 1);

        let result = outcome.result.unwrap();
        assert_eq!(result.identifier.as_str(), "UID_04A1B2C3");
        assert!(!result.has_pan());
        assert_eq!(tap.emitted.len(), 1);
        assert_eq!(tap.diagnostics[0].classification, ErrorClassification::PartialRead);
    }

    #[test]
    fn test_uid_result_has_no_card_type() {
        let atr = "3B 8A 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 90 00";
        let mut hints = MemoryHintCache::new(10);
        // another card with the same ATR was read as Visa earlier
        hints.record_success(
            &card_fingerprint(&hex::decode(atr.replace(' ', "")).unwrap()),
            "A0000000031010",
            CardType::Visa,
            Duration::from_millis(20),
        );

        let mut reader = card(atr, vec![exchange("FF CA 00 00 00", "04 A1 B2 C3 90 00")]);
        let tap = run_tap(&mut reader, &mut hints);

        let result = tap.outcome.unwrap().result.unwrap();
        assert_eq!(result.identifier.as_str(), "UID_04A1B2C3");
        assert_eq!(result.card_type, CardType::Unknown);
    }

    #[test]
    fn test_atr_is_the_last_resort() {
        let mut reader = card(
            "3B 8A 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 90 00",
            Vec::new(),
        );
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        let result = outcome.result.unwrap();
        assert_eq!(result.identifier.as_str(), "ATR_0300010000009000");
        assert_eq!(result.source, ExtractionSource::Atr);
        assert_eq!(
            outcome.attempt.command_log().len(),
            2 + default_aid_order().len() + UID_COMMANDS.len()
        );
        assert_eq!(tap.diagnostics[0].classification, ErrorClassification::PartialRead);
    }

    #[test]
    fn test_short_atr_is_unrecognized() {
        let mut reader = card("3B 00", Vec::new());
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        assert_eq!(outcome.attempt.outcome(), Some(AttemptOutcome::Unrecognized));
        assert!(outcome.result.is_none());
        assert!(tap.emitted.is_empty());
        assert_eq!(
            tap.diagnostics[0].classification,
            ErrorClassification::CardNotRecognized
        );
    }

    #[test]
    fn test_consecutive_timeouts_abort_the_walk() {
        let mut reader = card(
            "3B 8A 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 90 00",
            vec![failing("00 A4*", ScriptedFailure::Timeout)],
        );
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        assert_eq!(
            outcome.attempt.outcome(),
            Some(AttemptOutcome::TransportError)
        );
        assert_eq!(
            outcome.attempt.command_log().len(),
            Settings::default().max_consecutive_timeouts as usize
        );
        assert!(tap.emitted.is_empty());
        assert_eq!(tap.diagnostics[0].classification, ErrorClassification::TimeoutError);
        assert!(*reader.disconnected.borrow());
    }

    #[test]
    fn test_card_removed_mid_session() {
        let mut reader = card(
            "3B 8A 80 01 80 4F 0C A0 00 00 03 06 03 00 01 00 00 00 90 00",
            vec![
                exchange(
                    "00 A4 04 00 0E 32 50 41 59 2E 53 59 53 2E 44 44 46 30 31 00",
                    "6F 10 84 0E 32 50 41 59 2E 53 59 53 2E 44 44 46 30 31 90 00",
                ),
                failing("00 B2 01 0C 00", ScriptedFailure::CardRemoved),
            ],
        );
        let tap = run_tap(&mut reader, &mut NoHints);

        let outcome = tap.outcome.unwrap();
        assert_eq!(
            outcome.attempt.outcome(),
            Some(AttemptOutcome::TransportError)
        );
        assert_eq!(outcome.attempt.command_log().len(), 2);
        assert!(tap.emitted.is_empty());

        let record = &tap.diagnostics[0];
        assert_eq!(
            record.classification,
            ErrorClassification::EmvCommunicationError
        );
        assert!(record
            .notes
            .contains(&"Walk aborted: card removed mid-session".to_string()));
        assert!(*reader.disconnected.borrow());
    }
}
