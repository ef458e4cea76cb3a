/// The host's error taxonomy (§7): every public operation that can fail
/// resolves to one of these nine variants, regardless of which subsystem
/// raised it. Narrower `thiserror` enums at individual seams (the engine
/// crate's `TransportError`, `QueueError`) convert into this one via `From`
/// so callers of the `Controller` only ever handle a single error type.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The transport could not be opened, or dropped and exhausted its
    /// reconnect attempts.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport was connected but a request timed out waiting for a
    /// connect-time handshake (distinct from a per-command timeout).
    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),

    /// A dispatched command did not resolve within its configured timeout
    /// after exhausting retries.
    #[error("command timed out: {0}")]
    CommandTimeout(String),

    /// The machine is not in a state that allows the requested operation
    /// (e.g. jogging while not `Idle`, homing while in `Alarm`).
    #[error("machine not ready: {0}")]
    MachineNotReady(String),

    /// The parser rejected a program or line as invalid G-code.
    #[error("invalid g-code: {0}")]
    InvalidGCode(String),

    /// The command queue is full (§4.2: length >= 50).
    #[error("command buffer overflow: {0}")]
    BufferOverflow(String),

    /// The device reported an error or alarm that the caller must surface
    /// directly (as opposed to one absorbed by retry/recovery logic).
    #[error("hardware error: {0}")]
    HardwareError(String),

    /// The safety validator rejected a line before it was ever sent.
    #[error("safety violation: {0}")]
    SafetyViolation(String),

    /// The operation was cancelled by `emergency_stop`, `soft_reset`, or an
    /// explicit queue `clear()`.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_variant_specific_messages() {
        let err = HostError::SafetyViolation("G0 X1000 exceeds soft limits".to_string());
        assert!(err.to_string().contains("safety violation"));
    }
}
