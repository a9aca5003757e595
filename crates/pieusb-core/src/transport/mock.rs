//! Mock USB transport for testing.
//!
//! Decodes the register-level bridge protocol written by the engine and
//! answers from per-opcode scripted replies.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::*;

/// Scripted answer to one command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Status OK after the header and after any data-out phase.
    Good,
    /// Status READ, the given bytes on the bulk endpoint, then OK.
    /// Reads past the end of the data return zeros.
    Data(Vec<u8>),
    /// Raw status register sequence; OK once exhausted.
    Status(Vec<u8>),
}

impl MockReply {
    fn statuses(&self) -> VecDeque<u8> {
        match self {
            MockReply::Good => VecDeque::from([USB_STATUS_OK, USB_STATUS_OK]),
            MockReply::Data(_) => VecDeque::from([USB_STATUS_READ, USB_STATUS_OK]),
            MockReply::Status(seq) => seq.iter().copied().collect(),
        }
    }
}

/// One command frame as decoded by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCommand {
    pub header: [u8; SCSI_COMMAND_LEN],
    pub payload: Vec<u8>,
}

impl MockCommand {
    pub fn opcode(&self) -> u8 {
        self.header[0]
    }

    /// Big-endian size field of the header.
    pub fn size(&self) -> u16 {
        u16::from_be_bytes([self.header[3], self.header[4]])
    }
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    always_busy: bool,
    par_data: u8,
    header: Option<Vec<u8>>,
    statuses: VecDeque<u8>,
    bulk: VecDeque<u8>,
    announced: Vec<u32>,
    log: Vec<MockCommand>,
    resets: usize,
    queues: HashMap<u8, VecDeque<MockReply>>,
    defaults: HashMap<u8, MockReply>,
}

impl MockState {
    fn reply_for(&mut self, opcode: u8) -> MockReply {
        if let Some(reply) = self.queues.get_mut(&opcode).and_then(|q| q.pop_front()) {
            return reply;
        }
        if let Some(reply) = self.defaults.get(&opcode) {
            return reply.clone();
        }
        match opcode {
            SCSI_READ | SCSI_REQUEST_SENSE | SCSI_PARAM | SCSI_INQUIRY | SCSI_COPY
            | SCSI_MODE_SENSE | SCSI_READ_GAIN_OFFSET | SCSI_READ_STATE => {
                MockReply::Data(Vec::new())
            }
            _ => MockReply::Good,
        }
    }

    fn strobe(&mut self) {
        match self.par_data {
            IEEE1284_SCSI => {
                self.header = Some(Vec::with_capacity(SCSI_COMMAND_LEN));
                self.statuses.clear();
                self.bulk.clear();
            }
            IEEE1284_RESET => {
                self.resets += 1;
                self.header = None;
                self.statuses.clear();
                self.bulk.clear();
            }
            _ => {}
        }
    }

    fn command_byte(&mut self, byte: u8) {
        if let Some(header) = self.header.as_mut() {
            header.push(byte);
            if header.len() == SCSI_COMMAND_LEN {
                let mut raw = [0u8; SCSI_COMMAND_LEN];
                raw.copy_from_slice(header);
                self.header = None;
                let reply = self.reply_for(raw[0]);
                self.statuses = reply.statuses();
                if let MockReply::Data(bytes) = reply {
                    self.bulk = bytes.into();
                }
                self.log.push(MockCommand {
                    header: raw,
                    payload: Vec::new(),
                });
            }
        } else if let Some(last) = self.log.last_mut() {
            last.payload.push(byte);
        }
    }
}

/// Mock transport for unit testing the engine and session.
///
/// Clones share state, so a test can keep a handle after moving the
/// transport into a session.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                connected: true,
                ..Default::default()
            })),
            vid: PIE_VENDOR_ID,
            pid: PRODUCT_ID_7200,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a reply for the next command with `opcode`.
    pub fn queue_reply(&self, opcode: u8, reply: MockReply) {
        self.state()
            .queues
            .entry(opcode)
            .or_default()
            .push_back(reply);
    }

    /// Queue bulk data for the next command with `opcode`.
    pub fn queue_data(&self, opcode: u8, data: &[u8]) {
        self.queue_reply(opcode, MockReply::Data(data.to_vec()));
    }

    /// Queue a raw status sequence for the next command with `opcode`.
    pub fn queue_status(&self, opcode: u8, statuses: &[u8]) {
        self.queue_reply(opcode, MockReply::Status(statuses.to_vec()));
    }

    /// Reply used for `opcode` whenever its queue is empty.
    pub fn set_default_reply(&self, opcode: u8, reply: MockReply) {
        self.state().defaults.insert(opcode, reply);
    }

    /// Report BUSY on every status read.
    pub fn set_always_busy(&self, busy: bool) {
        self.state().always_busy = busy;
    }

    /// All decoded command frames so far.
    pub fn commands(&self) -> Vec<MockCommand> {
        self.state().log.clone()
    }

    /// Decoded command frames with the given opcode.
    pub fn commands_with_opcode(&self, opcode: u8) -> Vec<MockCommand> {
        self.state()
            .log
            .iter()
            .filter(|c| c.opcode() == opcode)
            .cloned()
            .collect()
    }

    /// Clear the command log.
    pub fn clear_commands(&self) {
        self.state().log.clear();
    }

    /// Sizes announced through the bulk size preamble.
    pub fn announced_sizes(&self) -> Vec<u32> {
        self.state().announced.clone()
    }

    /// Number of bridge resets seen.
    pub fn reset_count(&self) -> usize {
        self.state().resets
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.state().connected = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.state().connected = true;
    }

    /// Set VID/PID for device matching tests.
    pub fn set_ids(&mut self, vid: u16, pid: u16) {
        self.vid = vid;
        self.pid = pid;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn control_out(&self, request: u8, value: u16, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        match (request, value) {
            (REQUEST_REGISTER, PORT_PAR_DATA) => {
                state.par_data = data.first().copied().unwrap_or_default();
            }
            (REQUEST_REGISTER, PORT_PAR_CTRL) => {
                if data.first().is_some_and(|b| b & C1284_NSTROBE != 0) {
                    state.strobe();
                }
            }
            (REQUEST_REGISTER, PORT_SCSI_CMD) => {
                for &b in data {
                    state.command_byte(b);
                }
            }
            (REQUEST_BUFFER, PORT_SCSI_SIZE) if data.len() >= 8 => {
                let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
                state.announced.push(size);
            }
            _ => {
                return Err(TransportError::ControlFailed(format!(
                    "unexpected control out: request=0x{request:02X} value=0x{value:04X}"
                )));
            }
        }
        Ok(())
    }

    fn control_in(&self, request: u8, value: u16, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if request != REQUEST_REGISTER || value != PORT_SCSI_STATUS {
            return Err(TransportError::ControlFailed(format!(
                "unexpected control in: request=0x{request:02X} value=0x{value:04X}"
            )));
        }
        let status = if state.always_busy {
            USB_STATUS_BUSY
        } else {
            state.statuses.pop_front().unwrap_or(USB_STATUS_OK)
        };
        let mut out = vec![0u8; len.max(1)];
        out[0] = status;
        Ok(out)
    }

    fn bulk_read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        let take = max_len.min(state.bulk.len());
        let mut out: Vec<u8> = state.bulk.drain(..take).collect();
        out.resize(max_len, 0);
        Ok(out)
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select_scsi(mock: &MockTransport) {
        for b in IEEE1284_PREAMBLE {
            mock.write_register(PORT_PAR_DATA, b).unwrap();
        }
        mock.write_register(PORT_PAR_DATA, IEEE1284_SCSI).unwrap();
        mock.write_register(PORT_PAR_CTRL, C1284_NINIT | C1284_NSTROBE)
            .unwrap();
        mock.write_register(PORT_PAR_CTRL, C1284_NINIT).unwrap();
        mock.write_register(PORT_PAR_DATA, 0xFF).unwrap();
    }

    #[test]
    fn test_mock_decodes_header_and_payload() {
        let mock = MockTransport::new();
        select_scsi(&mock);
        for b in [SCSI_SLIDE, 0, 0, 0, 4, 0] {
            mock.write_register(PORT_SCSI_CMD, b).unwrap();
        }
        assert_eq!(mock.read_status().unwrap(), USB_STATUS_OK);
        for b in [SLIDE_NEXT, 1, 0, 0] {
            mock.write_register(PORT_SCSI_CMD, b).unwrap();
        }
        assert_eq!(mock.read_status().unwrap(), USB_STATUS_OK);

        let cmds = mock.commands();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].opcode(), SCSI_SLIDE);
        assert_eq!(cmds[0].size(), 4);
        assert_eq!(cmds[0].payload, vec![SLIDE_NEXT, 1, 0, 0]);
    }

    #[test]
    fn test_mock_data_reply() {
        let mock = MockTransport::new();
        mock.queue_data(SCSI_INQUIRY, &[1, 2, 3]);
        select_scsi(&mock);
        for b in [SCSI_INQUIRY, 0, 0, 0, 5, 0] {
            mock.write_register(PORT_SCSI_CMD, b).unwrap();
        }
        assert_eq!(mock.read_status().unwrap(), USB_STATUS_READ);
        assert_eq!(mock.bulk_read(5).unwrap(), vec![1, 2, 3, 0, 0]);
        assert_eq!(mock.read_status().unwrap(), USB_STATUS_OK);
    }

    #[test]
    fn test_mock_reset_counted() {
        let mock = MockTransport::new();
        mock.write_register(PORT_PAR_DATA, IEEE1284_RESET).unwrap();
        mock.write_register(PORT_PAR_CTRL, C1284_NINIT | C1284_NSTROBE)
            .unwrap();
        assert_eq!(mock.reset_count(), 1);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(mock.read_status().is_err());

        mock.reconnect();
        assert!(mock.read_status().is_ok());
    }

    #[test]
    fn test_mock_always_busy() {
        let mock = MockTransport::new();
        mock.set_always_busy(true);
        assert_eq!(mock.read_status().unwrap(), USB_STATUS_BUSY);
        assert_eq!(mock.read_status().unwrap(), USB_STATUS_BUSY);
    }
}
