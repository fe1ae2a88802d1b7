use crate::fields::luhn_valid;
use crate::session::SessionSignals;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardType {
    Visa,
    Mastercard,
    Maestro,
    Amex,
    Girocard,
    Jcb,
    Diners,
    Discover,
    Unknown,
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CardType::Visa => "visa",
            CardType::Mastercard => "mastercard",
            CardType::Maestro => "maestro",
            CardType::Amex => "amex",
            CardType::Girocard => "girocard",
            CardType::Jcb => "jcb",
            CardType::Diners => "diners",
            CardType::Discover => "discover",
            CardType::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Issuer identification range: PANs whose first `digits` digits fall into
/// `low..=high` and whose length is in `lengths`.
#[derive(Debug)]
pub struct PrefixRule {
    pub low: u32,
    pub high: u32,
    pub digits: usize,
    pub lengths: RangeInclusive<usize>,
    pub card_type: CardType,
}

const fn rule(
    low: u32,
    high: u32,
    digits: usize,
    lengths: RangeInclusive<usize>,
    card_type: CardType,
) -> PrefixRule {
    PrefixRule {
        low,
        high,
        digits,
        lengths,
        card_type,
    }
}

pub static PREFIX_RULES: [PrefixRule; 20] = [
    rule(622126, 622925, 6, 16..=19, CardType::Discover),
    rule(2221, 2720, 4, 16..=16, CardType::Mastercard),
    rule(5018, 5018, 4, 12..=19, CardType::Maestro),
    rule(5020, 5020, 4, 12..=19, CardType::Maestro),
    rule(5038, 5038, 4, 12..=19, CardType::Maestro),
    rule(6304, 6304, 4, 12..=19, CardType::Maestro),
    rule(6759, 6759, 4, 12..=19, CardType::Maestro),
    rule(6761, 6763, 4, 12..=19, CardType::Maestro),
    rule(3528, 3589, 4, 16..=19, CardType::Jcb),
    rule(6011, 6011, 4, 16..=19, CardType::Discover),
    rule(672, 679, 3, 16..=19, CardType::Girocard),
    rule(644, 649, 3, 16..=19, CardType::Discover),
    rule(300, 305, 3, 14..=19, CardType::Diners),
    rule(34, 34, 2, 15..=15, CardType::Amex),
    rule(37, 37, 2, 15..=15, CardType::Amex),
    rule(51, 55, 2, 16..=16, CardType::Mastercard),
    rule(36, 36, 2, 14..=19, CardType::Diners),
    rule(38, 38, 2, 14..=19, CardType::Diners),
    rule(65, 65, 2, 16..=19, CardType::Discover),
    rule(4, 4, 1, 13..=19, CardType::Visa),
];

const PREFIX_WIDTHS: [usize; 5] = [6, 4, 3, 2, 1];

/// Cards known to refuse standard AID selection while still being genuine.
/// The override only counts when the session shows the expected behaviour.
#[derive(Debug)]
pub struct KnownCard {
    pub prefix: &'static str,
    pub card_type: CardType,
    pub name: &'static str,
    pub pse_success_expected: bool,
    pub aid_failures_expected: &'static [&'static str],
    pub confidence_boost: u8,
    pub auto_approve: bool,
}

pub static KNOWN_CARDS: [KnownCard; 3] = [
    KnownCard {
        prefix: "422056",
        card_type: CardType::Visa,
        name: "Visa Debit (restricted chip)",
        pse_success_expected: true,
        aid_failures_expected: &["A0000001523010", "D27600002545500200"],
        confidence_boost: 40,
        auto_approve: true,
    },
    KnownCard {
        prefix: "444952",
        card_type: CardType::Visa,
        name: "Visa (restricted chip)",
        pse_success_expected: true,
        aid_failures_expected: &["A0000001523010"],
        confidence_boost: 35,
        auto_approve: true,
    },
    KnownCard {
        prefix: "537228",
        card_type: CardType::Mastercard,
        name: "Mastercard Debit",
        pse_success_expected: true,
        aid_failures_expected: &[],
        confidence_boost: 20,
        auto_approve: false,
    },
];

impl KnownCard {
    pub fn signature_matches(&self, signals: &SessionSignals) -> bool {
        if self.pse_success_expected && !signals.pse_success {
            return false;
        }

        self.aid_failures_expected
            .iter()
            .all(|aid| signals.aid_failed(aid))
    }
}

pub fn known_card(pan: &str) -> Option<&'static KnownCard> {
    KNOWN_CARDS.iter().find(|card| pan.starts_with(card.prefix))
}

pub fn match_prefix_rule(pan: &str) -> Option<&'static PrefixRule> {
    if pan.is_empty() || !pan.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    for width in PREFIX_WIDTHS {
        let prefix: u32 = match pan.get(0..width).and_then(|p| p.parse().ok()) {
            Some(prefix) => prefix,
            None => continue,
        };

        let found = PREFIX_RULES.iter().find(|rule| {
            rule.digits == width
                && (rule.low..=rule.high).contains(&prefix)
                && rule.lengths.contains(&pan.len())
        });
        if found.is_some() {
            return found;
        }
    }

    None
}

fn first_digit_guess(pan: &str) -> Option<CardType> {
    match pan.chars().next()? {
        '4' => Some(CardType::Visa),
        '5' => Some(CardType::Mastercard),
        '6' => Some(CardType::Maestro),
        '3' => Some(CardType::Amex),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassificationRule {
    KnownCard {
        prefix: String,
        signature_matched: bool,
    },
    PrefixTable,
    FirstDigit,
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub card_type: CardType,
    pub confidence: u8,
    pub auto_approve: bool,
    pub luhn_valid: bool,
    pub rule: ClassificationRule,
}

const KNOWN_CARD_BASE: u32 = 50;
const PREFIX_TABLE_BASE: u32 = 60;
const FIRST_DIGIT_BASE: u32 = 30;
const FIRST_DIGIT_CEILING: u32 = 50;
const NO_MATCH_BASE: u32 = 10;
const SIGNAL_WEIGHT: u32 = 10;
const MAX_CONFIDENCE: u32 = 100;

pub fn classify(pan: &str, signals: &SessionSignals) -> Classification {
    let luhn = luhn_valid(pan);

    let signal_score: u32 = [
        signals.pse_success,
        signals.selected_aid.is_some(),
        luhn,
    ]
    .iter()
    .map(|present| signal_weight(*present))
    .sum();

    let (card_type, score, auto_approve, rule) = if let Some(card) = known_card(pan) {
        let matched = card.signature_matches(signals);
        info!(
            "Known card {} ({}), session signature matched: {}",
            card.prefix, card.name, matched
        );
        let boost = if matched { card.confidence_boost as u32 } else { 0 };
        (
            card.card_type,
            KNOWN_CARD_BASE + boost + signal_score,
            matched && card.auto_approve,
            ClassificationRule::KnownCard {
                prefix: card.prefix.to_string(),
                signature_matched: matched,
            },
        )
    } else if let Some(rule) = match_prefix_rule(pan) {
        (
            rule.card_type,
            PREFIX_TABLE_BASE + signal_score,
            false,
            ClassificationRule::PrefixTable,
        )
    } else if let Some(card_type) = first_digit_guess(pan) {
        (
            card_type,
            (FIRST_DIGIT_BASE + signal_score).min(FIRST_DIGIT_CEILING),
            false,
            ClassificationRule::FirstDigit,
        )
    } else {
        (
            CardType::Unknown,
            NO_MATCH_BASE + signal_score,
            false,
            ClassificationRule::NoMatch,
        )
    };

    let classification = Classification {
        card_type,
        confidence: score.min(MAX_CONFIDENCE) as u8,
        auto_approve,
        luhn_valid: luhn,
        rule,
    };
    debug!("Classification: {:?}", classification);

    classification
}

fn signal_weight(present: bool) -> u32 {
    if present {
        SIGNAL_WEIGHT
    } else {
        0
    }
}

// Observed reader ATRs, most specific first
static ATR_HINTS: [(&str, &str); 6] = [
    ("3B8F8001804F0CA000000306030001000000006A", "Mastercard standard"),
    ("3B8A8001804F0CA0000003060300010000009000", "Visa standard"),
    ("3B9F958073FF8F7E81B180", "girocard"),
    ("3B8F8001", "Mastercard family"),
    ("3B8A8001", "Visa family"),
    ("3B9F95", "German girocard family"),
];

pub fn atr_family_hint(atr: &[u8]) -> Option<&'static str> {
    let atr_hex = hex::encode_upper(atr);

    ATR_HINTS
        .iter()
        .find(|(pattern, _)| atr_hex.starts_with(pattern))
        .map(|(_, hint)| *hint)
        .or_else(|| {
            if atr_hex.contains("8F7E") {
                Some("possibly Sparkasse girocard")
            } else {
                None
            }
        })
}
