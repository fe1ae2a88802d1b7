use crate::classifier::CardType;
use log::trace;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

const MAX_AIDS_PER_CARD: usize = 10;

/// Per-card knowledge carried between taps to shorten the AID search.
pub trait SessionHintCache {
    fn get_optimized_candidate_order(
        &self,
        fingerprint: &str,
        default_order: &[String],
    ) -> Vec<String>;

    fn record_success(
        &mut self,
        fingerprint: &str,
        aid: &str,
        card_type: CardType,
        elapsed: Duration,
    );
}

/// Keeps the default order and remembers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHints;

impl SessionHintCache for NoHints {
    fn get_optimized_candidate_order(
        &self,
        _fingerprint: &str,
        default_order: &[String],
    ) -> Vec<String> {
        default_order.to_vec()
    }

    fn record_success(
        &mut self,
        _fingerprint: &str,
        _aid: &str,
        _card_type: CardType,
        _elapsed: Duration,
    ) {
    }
}

#[derive(Debug, Clone)]
struct AidTiming {
    aid: String,
    average: Duration,
}

#[derive(Debug, Clone)]
struct CardHints {
    // newest first
    aids: Vec<AidTiming>,
}

/// Bounded in-memory cache keyed by card fingerprint. When full, the card
/// that was first cached is evicted.
#[derive(Debug, Clone)]
pub struct MemoryHintCache {
    cards: HashMap<String, CardHints>,
    insertion_order: VecDeque<String>,
    max_cards: usize,
}

impl MemoryHintCache {
    pub fn new(max_cards: usize) -> MemoryHintCache {
        MemoryHintCache {
            cards: HashMap::new(),
            insertion_order: VecDeque::new(),
            max_cards: max_cards.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

impl SessionHintCache for MemoryHintCache {
    fn get_optimized_candidate_order(
        &self,
        fingerprint: &str,
        default_order: &[String],
    ) -> Vec<String> {
        let hints = match self.cards.get(fingerprint) {
            Some(hints) => hints,
            None => return default_order.to_vec(),
        };

        let mut known = hints.aids.clone();
        // stable: equally fast AIDs keep newest first
        known.sort_by_key(|timing| timing.average);

        let mut order: Vec<String> = known.into_iter().map(|timing| timing.aid).collect();
        for aid in default_order {
            if !order.contains(aid) {
                order.push(aid.clone());
            }
        }
        trace!(
            "Hinted AID order for {}: {:?}",
            fingerprint,
            &order[..order.len().min(3)]
        );

        order
    }

    fn record_success(
        &mut self,
        fingerprint: &str,
        aid: &str,
        card_type: CardType,
        elapsed: Duration,
    ) {
        if !self.cards.contains_key(fingerprint) {
            self.insertion_order.push_back(fingerprint.to_string());
        }

        trace!("{} answered {} as {:?}", fingerprint, aid, card_type);
        let hints = self
            .cards
            .entry(fingerprint.to_string())
            .or_insert_with(|| CardHints { aids: Vec::new() });

        match hints.aids.iter_mut().find(|timing| timing.aid == aid) {
            Some(timing) => timing.average = (timing.average + elapsed) / 2,
            None => {
                hints.aids.insert(
                    0,
                    AidTiming {
                        aid: aid.to_string(),
                        average: elapsed,
                    },
                );
                hints.aids.truncate(MAX_AIDS_PER_CARD);
            }
        }

        while self.cards.len() > self.max_cards {
            match self.insertion_order.pop_front() {
                Some(oldest) => {
                    trace!("Evicting hints for {}", oldest);
                    self.cards.remove(&oldest);
                }
                None => break,
            }
        }
    }
}
