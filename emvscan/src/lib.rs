//! Payment card recognition over ISO 7816 / EMV: walks a card through the
//! payment system directory, application selection, processing options and
//! record reads until it yields a card number, a UID or at least an ATR based
//! identifier, then classifies what it found.
//!
//! The crate never makes an access decision. Results go to a [`ResultEmitter`],
//! every attempt that was not a clean read goes to a [`DiagnosticsSink`].

pub mod apdu;
pub mod bcdutil;
pub mod classifier;
pub mod diagnostics;
pub mod dol;
pub mod emitter;
pub mod error;
pub mod fields;
pub mod hints;
pub mod session;
pub mod settings;
pub mod tlv;
pub mod transport;
pub mod walker;

pub use classifier::{classify, CardType, Classification};
pub use diagnostics::{
    ChannelDiagnostics, DiagnosticRecord, DiagnosticsSink, ErrorClassification, LogDiagnostics,
};
pub use emitter::{DedupEmitter, LogEmitter, RecentScans, ResultEmitter};
pub use error::{SettingsError, TlvError, TransportError, WalkAbort};
pub use fields::{luhn_valid, mask_pan, Expiry};
pub use hints::{MemoryHintCache, NoHints, SessionHintCache};
pub use session::{
    AttemptOutcome, CardIdentifier, CardReadAttempt, CardRecognitionResult, ExtractionSource,
};
pub use settings::Settings;
pub use transport::{CardConnection, CardReader};
pub use walker::{ProtocolWalker, TapOutcome};
