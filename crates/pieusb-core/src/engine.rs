//! Command engine: frames commands through the IEEE1284 bridge and resolves
//! the status register into a [`CommandOutcome`].

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, trace, warn};

use crate::protocol::constants::*;
use crate::protocol::{CommandFrame, CommandOutcome, SenseInfo};
use crate::transport::{TransportError, UsbTransport};

/// Delays used by the engine. All are configurable so tests can run with
/// zero delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineTiming {
    /// Wall-clock bound of one command, retries included.
    #[serde(with = "millis")]
    pub command_timeout: Duration,
    /// Pause after the device answers BUSY followed by AGAIN.
    #[serde(with = "millis")]
    pub busy_retry: Duration,
    /// Pause between an IEEE1284 command byte and its strobe.
    #[serde(with = "millis")]
    pub ieee_settle: Duration,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            busy_retry: Duration::from_secs(1),
            ieee_settle: Duration::from_millis(3),
        }
    }
}

impl EngineTiming {
    /// No delays and a short command bound.
    pub fn immediate() -> Self {
        Self {
            command_timeout: Duration::from_millis(500),
            busy_retry: Duration::ZERO,
            ieee_settle: Duration::ZERO,
        }
    }
}

/// Serialize durations as integer milliseconds in config files.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Sends command frames and applies the retry policy.
pub struct CommandEngine<T: UsbTransport> {
    transport: T,
    timing: EngineTiming,
}

impl<T: UsbTransport> CommandEngine<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timing(transport, EngineTiming::default())
    }

    pub fn with_timing(transport: T, timing: EngineTiming) -> Self {
        Self { transport, timing }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn timing(&self) -> EngineTiming {
        self.timing
    }

    pub fn set_timing(&mut self, timing: EngineTiming) {
        self.timing = timing;
    }

    /// Send a command and return only its outcome.
    pub fn send_command(&self, frame: &CommandFrame) -> CommandOutcome {
        match self.execute(frame) {
            Ok(_) => CommandOutcome::Good,
            Err(outcome) => outcome,
        }
    }

    /// Send a command; on success return the bytes read in its data phase.
    ///
    /// The loop re-sends on AGAIN, follows BUSY with a second status read,
    /// fetches sense data on CHECK and resets the bridge on FAIL/ERROR. When
    /// the wall-clock bound elapses the outcome is `DeviceBusy`.
    #[instrument(level = "debug", skip(self, frame), fields(opcode = %format!("0x{:02X}", frame.opcode()), name = frame.name()))]
    pub fn execute(&self, frame: &CommandFrame) -> Result<Vec<u8>, CommandOutcome> {
        let start = Instant::now();
        let mut outcome = CommandOutcome::DeviceBusy;
        let mut status = USB_STATUS_AGAIN;
        let mut data = Vec::new();

        while start.elapsed() < self.timing.command_timeout {
            match status {
                USB_STATUS_AGAIN => {
                    match self.transfer(frame) {
                        Ok((st, bytes)) => {
                            status = st;
                            data = bytes;
                        }
                        Err(e) => {
                            warn!(error = %e, "Transport failure during command");
                            status = USB_STATUS_ERROR;
                        }
                    }
                    trace!(status = %format!("0x{:02X}", status), "Command transferred");
                }
                USB_STATUS_OK => {
                    outcome = CommandOutcome::Good;
                    break;
                }
                USB_STATUS_READ => {
                    error!("Second READ status after data phase");
                    outcome = CommandOutcome::IoError;
                    break;
                }
                USB_STATUS_CHECK => {
                    if frame.opcode() == SCSI_REQUEST_SENSE {
                        error!("Check condition on REQUEST SENSE");
                        outcome = CommandOutcome::Invalid;
                        break;
                    }
                    outcome = match self.request_sense() {
                        Ok(sense) => {
                            debug!(sense = %sense, "Check condition");
                            sense.outcome()
                        }
                        Err(failed) => {
                            error!(outcome = %failed, "Check condition, but REQUEST SENSE failed");
                            failed
                        }
                    };
                    break;
                }
                USB_STATUS_BUSY => match self.transport.read_status() {
                    Ok(st) => {
                        status = st;
                        if status == USB_STATUS_AGAIN {
                            thread::sleep(self.timing.busy_retry);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Status read failed while busy");
                        outcome = CommandOutcome::IoError;
                        break;
                    }
                },
                USB_STATUS_FAIL | USB_STATUS_ERROR => {
                    if let Err(e) = self.reset() {
                        error!(error = %e, "Bridge reset failed");
                    }
                    outcome = CommandOutcome::IoError;
                    break;
                }
                other => {
                    error!(status = %format!("0x{:02X}", other), "Unhandled status");
                    outcome = CommandOutcome::IoError;
                    break;
                }
            }
        }

        if outcome == CommandOutcome::DeviceBusy {
            warn!(
                timeout_ms = self.timing.command_timeout.as_millis() as u64,
                "Command timed out"
            );
        }
        debug!(outcome = %outcome, bytes = data.len(), "Command finished");
        match outcome {
            CommandOutcome::Good => Ok(data),
            other => Err(other),
        }
    }

    /// Fetch and decode sense data.
    pub fn request_sense(&self) -> Result<SenseInfo, CommandOutcome> {
        let bytes = self.execute(&CommandFrame::read(SCSI_REQUEST_SENSE, SENSE_LEN))?;
        Ok(SenseInfo::from_bytes(&bytes))
    }

    /// Re-synchronize the bridge framing state.
    pub fn reset(&self) -> Result<(), TransportError> {
        debug!("Resetting bridge");
        self.ieee_command(IEEE1284_RESET)
    }

    /// One attempt: select, header, status, then the data phase if any.
    fn transfer(&self, frame: &CommandFrame) -> Result<(u8, Vec<u8>), TransportError> {
        self.ieee_command(IEEE1284_SCSI)?;
        for b in frame.header() {
            self.transport.write_register(PORT_SCSI_CMD, b)?;
        }

        let mut status = self.transport.read_status()?;
        let mut data = Vec::new();
        if status == USB_STATUS_OK && !frame.payload().is_empty() {
            for &b in frame.payload() {
                self.transport.write_register(PORT_SCSI_CMD, b)?;
            }
            status = self.transport.read_status()?;
        } else if status == USB_STATUS_READ {
            data = self.bulk_in(frame.read_len())?;
            status = self.transport.read_status()?;
        }
        Ok((status, data))
    }

    fn ieee_command(&self, command: u8) -> Result<(), TransportError> {
        for b in IEEE1284_PREAMBLE {
            self.transport.write_register(PORT_PAR_DATA, b)?;
        }
        self.transport.write_register(PORT_PAR_DATA, command)?;
        thread::sleep(self.timing.ieee_settle);
        self.transport
            .write_register(PORT_PAR_CTRL, C1284_NINIT | C1284_NSTROBE)?;
        self.transport.write_register(PORT_PAR_CTRL, C1284_NINIT)?;
        self.transport.write_register(PORT_PAR_DATA, 0xFF)
    }

    /// Read `len` bytes: a size preamble per part, then bulk chunks.
    fn bulk_in(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut data = Vec::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let part = remaining.min(MAX_BULK_PART);
            self.bulk_size(part as u32)?;
            let mut left = part;
            while left > 0 {
                let chunk = self.transport.bulk_read(left.min(MAX_BULK_CHUNK))?;
                if chunk.is_empty() {
                    return Err(TransportError::ReadFailed(format!(
                        "short bulk read, {} of {} bytes",
                        len - remaining + part - left,
                        len
                    )));
                }
                left = left.saturating_sub(chunk.len());
                data.extend_from_slice(&chunk);
            }
            remaining -= part;
        }
        data.truncate(len);
        Ok(data)
    }

    fn bulk_size(&self, size: u32) -> Result<(), TransportError> {
        let mut preamble = [0u8; 8];
        preamble[4..8].copy_from_slice(&size.to_le_bytes());
        self.transport
            .control_out(REQUEST_BUFFER, PORT_SCSI_SIZE, &preamble)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn engine() -> (CommandEngine<MockTransport>, MockTransport) {
        let mock = MockTransport::new();
        (
            CommandEngine::with_timing(mock.clone(), EngineTiming::immediate()),
            mock,
        )
    }

    fn sense_bytes(key: u8, code: u8, qualifier: u8) -> Vec<u8> {
        let mut raw = vec![0u8; SENSE_LEN];
        raw[0] = 0x70;
        raw[2] = key;
        raw[12] = code;
        raw[13] = qualifier;
        raw
    }

    #[test]
    fn test_good_command_without_data() {
        let (engine, mock) = engine();
        let outcome = engine.send_command(&CommandFrame::new(SCSI_TEST_UNIT_READY, 0));
        assert_eq!(outcome, CommandOutcome::Good);

        let cmds = mock.commands();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].header, [0, 0, 0, 0, 0, 0]);
        assert!(cmds[0].payload.is_empty());
    }

    #[test]
    fn test_data_out_is_written_after_header() {
        let (engine, mock) = engine();
        let frame = CommandFrame::write(SCSI_SLIDE, vec![SLIDE_LAMP_ON, 1, 0, 0]);
        assert_eq!(engine.send_command(&frame), CommandOutcome::Good);
        assert_eq!(mock.commands()[0].payload, vec![SLIDE_LAMP_ON, 1, 0, 0]);
    }

    #[test]
    fn test_data_in_is_read_in_chunks() {
        let (engine, mock) = engine();
        let len = MAX_BULK_CHUNK * 2 + 10;
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        mock.queue_data(SCSI_READ, &payload);

        let data = engine
            .execute(&CommandFrame::read_with_size(SCSI_READ, 3, len))
            .unwrap();
        assert_eq!(data, payload);
        assert_eq!(mock.announced_sizes(), vec![len as u32]);
        assert_eq!(mock.commands()[0].size(), 3);
    }

    #[test]
    fn test_again_resends_command() {
        let (engine, mock) = engine();
        mock.queue_status(SCSI_TEST_UNIT_READY, &[USB_STATUS_AGAIN]);
        let outcome = engine.send_command(&CommandFrame::new(SCSI_TEST_UNIT_READY, 0));
        assert_eq!(outcome, CommandOutcome::Good);
        assert_eq!(mock.commands_with_opcode(SCSI_TEST_UNIT_READY).len(), 2);
    }

    #[test]
    fn test_busy_then_again_resends_command() {
        let (engine, mock) = engine();
        mock.queue_status(SCSI_TEST_UNIT_READY, &[USB_STATUS_BUSY, USB_STATUS_AGAIN]);
        let outcome = engine.send_command(&CommandFrame::new(SCSI_TEST_UNIT_READY, 0));
        assert_eq!(outcome, CommandOutcome::Good);
        assert_eq!(mock.commands().len(), 2);
    }

    #[test]
    fn test_check_condition_fetches_sense() {
        let (engine, mock) = engine();
        mock.queue_status(SCSI_TEST_UNIT_READY, &[USB_STATUS_CHECK]);
        mock.queue_data(SCSI_REQUEST_SENSE, &sense_bytes(0x02, 0x04, 0x01));

        let outcome = engine.send_command(&CommandFrame::new(SCSI_TEST_UNIT_READY, 0));
        assert_eq!(outcome, CommandOutcome::WarmingUp);
        let sense = mock.commands_with_opcode(SCSI_REQUEST_SENSE);
        assert_eq!(sense.len(), 1);
        assert_eq!(sense[0].size(), SENSE_LEN as u16);
    }

    #[test]
    fn test_check_condition_must_calibrate() {
        let (engine, mock) = engine();
        mock.queue_status(SCSI_SCAN, &[USB_STATUS_CHECK]);
        mock.queue_data(SCSI_REQUEST_SENSE, &sense_bytes(0x06, 0x82, 0x00));
        let outcome = engine.send_command(&CommandFrame::new(SCSI_SCAN, 1));
        assert_eq!(outcome, CommandOutcome::MustCalibrate);
    }

    #[test]
    fn test_check_condition_on_request_sense_is_invalid() {
        let (engine, mock) = engine();
        mock.queue_status(SCSI_TEST_UNIT_READY, &[USB_STATUS_CHECK]);
        mock.queue_status(SCSI_REQUEST_SENSE, &[USB_STATUS_CHECK]);
        let outcome = engine.send_command(&CommandFrame::new(SCSI_TEST_UNIT_READY, 0));
        assert_eq!(outcome, CommandOutcome::Invalid);
    }

    #[test]
    fn test_error_status_resets_bridge() {
        let (engine, mock) = engine();
        mock.queue_status(SCSI_INQUIRY, &[USB_STATUS_ERROR]);
        let result = engine.execute(&CommandFrame::read(SCSI_INQUIRY, 256));
        assert_eq!(result, Err(CommandOutcome::IoError));
        assert_eq!(mock.reset_count(), 1);
    }

    #[test]
    fn test_unknown_status_is_io_error() {
        let (engine, mock) = engine();
        mock.queue_status(SCSI_TEST_UNIT_READY, &[0x42]);
        let outcome = engine.send_command(&CommandFrame::new(SCSI_TEST_UNIT_READY, 0));
        assert_eq!(outcome, CommandOutcome::IoError);
    }

    #[test]
    fn test_always_busy_is_bounded() {
        let (mut engine, mock) = engine();
        engine.set_timing(EngineTiming {
            command_timeout: Duration::from_millis(50),
            ..EngineTiming::immediate()
        });
        mock.set_always_busy(true);

        let start = Instant::now();
        let outcome = engine.send_command(&CommandFrame::new(SCSI_TEST_UNIT_READY, 0));
        assert_eq!(outcome, CommandOutcome::DeviceBusy);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_disconnected_transport_is_io_error() {
        let (engine, mock) = engine();
        mock.disconnect();
        let outcome = engine.send_command(&CommandFrame::new(SCSI_TEST_UNIT_READY, 0));
        assert_eq!(outcome, CommandOutcome::IoError);
    }

    #[test]
    fn test_timing_roundtrip_through_toml() {
        let timing = EngineTiming::default();
        let text = toml::to_string(&timing).unwrap();
        assert!(text.contains("command_timeout = 60000"));
        let back: EngineTiming = toml::from_str(&text).unwrap();
        assert_eq!(back, timing);
    }
}
