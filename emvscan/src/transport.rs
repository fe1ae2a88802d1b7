use crate::error::TransportError;

/// A live card session. The walker owns the connection for the whole attempt.
pub trait CardConnection {
    /// Sends one command APDU, returns response data followed by SW1 SW2.
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError>;

    fn atr(&self) -> Vec<u8>;

    fn disconnect(self)
    where
        Self: Sized;
}

pub trait CardReader {
    type Connection: CardConnection;

    fn connect(&mut self) -> Result<Self::Connection, TransportError>;
}
