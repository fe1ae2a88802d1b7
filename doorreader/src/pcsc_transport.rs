use emvscan::{CardConnection, CardReader, TransportError};
use hexplay::HexViewBuilder;
use log::{debug, info, warn};
use pcsc::{
    Card, Context, Disposition, Error, Protocols, ReaderState, Scope, ShareMode, State,
    MAX_ATR_SIZE, MAX_BUFFER_SIZE,
};
use std::ffi::CString;
use std::time::{Duration, Instant};

const MAX_READER_SIZE: usize = 2048;

fn map_error(err: Error) -> TransportError {
    match err {
        Error::NoSmartcard => TransportError::NoCard,
        Error::RemovedCard | Error::ResetCard => TransportError::CardRemoved,
        Error::Timeout => TransportError::Timeout,
        err => TransportError::Communication(err.to_string()),
    }
}

/// Names of the connected readers, narrowed to those containing `filter`.
pub fn list_readers(filter: Option<&str>) -> Result<Vec<CString>, String> {
    let ctx = Context::establish(Scope::User)
        .map_err(|err| format!("Failed to establish context: {}", err))?;
    let readers = ctx
        .list_readers_owned()
        .map_err(|err| format!("Failed to list readers: {}", err))?;

    Ok(readers
        .into_iter()
        .filter(|name| match filter {
            Some(filter) => name.to_string_lossy().contains(filter),
            None => true,
        })
        .collect())
}

pub struct PcscReader {
    ctx: Context,
    name: CString,
}

impl PcscReader {
    pub fn new(name: CString) -> Result<PcscReader, TransportError> {
        let ctx = Context::establish(Scope::User).map_err(map_error)?;
        Ok(PcscReader { ctx, name })
    }

    pub fn name(&self) -> String {
        self.name.to_string_lossy().into_owned()
    }

    /// Fresh PC/SC context after the resource manager or reader went away.
    pub fn reestablish(&mut self) -> Result<(), TransportError> {
        self.ctx = Context::establish(Scope::User).map_err(map_error)?;
        Ok(())
    }

    /// Blocks until the field is empty. `Ok(false)` when `timeout` passed first.
    pub fn wait_for_removal(&self, timeout: Duration) -> Result<bool, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut states = [ReaderState::new(self.name.clone(), State::UNAWARE)];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.ctx.get_status_change(remaining, &mut states) {
                Ok(()) => {}
                Err(Error::Timeout) => return Ok(false),
                Err(err) => return Err(map_error(err)),
            }

            if !states[0].event_state().contains(State::PRESENT) {
                return Ok(true);
            }
            if remaining.is_zero() {
                return Ok(false);
            }
            states[0].sync_current_state();
        }
    }
}

impl CardReader for PcscReader {
    type Connection = PcscConnection;

    fn connect(&mut self) -> Result<PcscConnection, TransportError> {
        let card = self
            .ctx
            .connect(&self.name, ShareMode::Shared, Protocols::ANY)
            .map_err(map_error)?;

        let mut names_buffer = [0; MAX_READER_SIZE];
        let mut atr_buffer = [0; MAX_ATR_SIZE];
        let card_status = card
            .status2(&mut names_buffer, &mut atr_buffer)
            .map_err(map_error)?;
        let atr = card_status.atr().to_vec();

        // https://www.eftlab.com/knowledge-base/171-atr-list-full/
        info!("Card reader: {:?}", self.name);
        debug!("Card ATR:\n{}", HexViewBuilder::new(&atr).finish());
        debug!("Card protocol: {:?}", card_status.protocol2());

        Ok(PcscConnection { card, atr })
    }
}

pub struct PcscConnection {
    card: Card,
    atr: Vec<u8>,
}

impl CardConnection for PcscConnection {
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut apdu_response_buffer = [0; MAX_BUFFER_SIZE];
        let apdu_response = self
            .card
            .transmit(apdu, &mut apdu_response_buffer)
            .map_err(map_error)?;

        Ok(apdu_response.to_vec())
    }

    fn atr(&self) -> Vec<u8> {
        self.atr.clone()
    }

    fn disconnect(self) {
        if let Err((_, err)) = self.card.disconnect(Disposition::ResetCard) {
            warn!("Could not disconnect the card: {}", err);
        }
    }
}
