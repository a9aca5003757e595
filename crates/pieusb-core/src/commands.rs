//! Typed scanner commands layered on the [`CommandEngine`].
//!
//! Every command returns the device outcome as its error so callers can
//! tell busy, warming-up and calibration requests apart from I/O failures.

use tracing::{debug, error, info};

use crate::engine::CommandEngine;
use crate::protocol::constants::*;
use crate::protocol::records::{self, FrameError};
use crate::protocol::{
    CommandFrame, CommandOutcome, HalftonePattern, Mode, ScanFrame, ScanParameters,
    ScannerProperties, ScannerState, Settings, ShadingParameters,
};
use crate::transport::UsbTransport;

fn decoded<R>(result: Result<R, FrameError>) -> Result<R, CommandOutcome> {
    result.map_err(|e| {
        error!(error = %e, "Malformed device response");
        CommandOutcome::IoError
    })
}

impl<T: UsbTransport> CommandEngine<T> {
    pub fn test_unit_ready(&self) -> CommandOutcome {
        self.send_command(&CommandFrame::new(SCSI_TEST_UNIT_READY, 0))
    }

    /// INQUIRY with the given allocation length (at most 256).
    pub fn inquiry(&self, size: u8) -> Result<ScannerProperties, CommandOutcome> {
        let mut data = self.execute(&CommandFrame::read(SCSI_INQUIRY, size as usize))?;
        // Short allocation lengths leave the tail zeroed.
        data.resize(ScannerProperties::SIZE, 0);
        decoded(ScannerProperties::from_bytes(&data))
    }

    pub fn slide(&self, action: u8) -> Result<(), CommandOutcome> {
        debug!(action = %format!("0x{:02X}", action), "Slide");
        self.execute(&CommandFrame::write(SCSI_SLIDE, vec![action, 0x01, 0, 0]))
            .map(|_| ())
    }

    /// Ask the device to prepare `code`/`index`, then read `len` bytes.
    fn prepared_read(&self, code: u8, index: u8, len: usize) -> Result<Vec<u8>, CommandOutcome> {
        self.execute(&CommandFrame::write(
            SCSI_WRITE,
            records::prepare_read(code, index),
        ))?;
        self.execute(&CommandFrame::read(SCSI_READ, len))
    }

    pub fn get_halftone_pattern(&self, index: u8) -> Result<HalftonePattern, CommandOutcome> {
        let data = self.prepared_read(WRITE_HALFTONE, index, HalftonePattern::READ_SIZE)?;
        decoded(HalftonePattern::from_bytes(&data))
    }

    pub fn get_scan_frame(&self, index: u8) -> Result<ScanFrame, CommandOutcome> {
        let data = self.prepared_read(WRITE_SCAN_FRAME, index, ScanFrame::READ_SIZE)?;
        decoded(ScanFrame::from_bytes(&data))
    }

    pub fn set_scan_frame(&self, frame: &ScanFrame) -> Result<(), CommandOutcome> {
        debug!(?frame, "Set scan frame");
        self.execute(&CommandFrame::write(SCSI_WRITE, frame.to_bytes()))
            .map(|_| ())
    }

    pub fn cmd_17(&self, value: u16) -> Result<(), CommandOutcome> {
        self.execute(&CommandFrame::write(SCSI_WRITE, records::cmd_17(value)))
            .map(|_| ())
    }

    fn set_per_filter(&self, code: u8, values: [u16; 3]) -> Result<(), CommandOutcome> {
        for (filter, value) in [FILTER_RED, FILTER_GREEN, FILTER_BLUE].into_iter().zip(values) {
            self.execute(&CommandFrame::write(
                SCSI_WRITE,
                records::filter_setting(code, filter, value),
            ))?;
        }
        Ok(())
    }

    /// Exposure time for the red, green and blue filters.
    pub fn set_exposure_time(&self, values: [u16; 3]) -> Result<(), CommandOutcome> {
        self.set_per_filter(WRITE_EXPOSURE, values)
    }

    /// Highlight/shadow level for the red, green and blue filters.
    pub fn set_highlight_shadow(&self, values: [u16; 3]) -> Result<(), CommandOutcome> {
        self.set_per_filter(WRITE_HIGHLIGHT_SHADOW, values)
    }

    pub fn get_shading_parameters(&self) -> Result<Vec<ShadingParameters>, CommandOutcome> {
        let data = self.prepared_read(WRITE_CALIBRATION_INFO, 0, ShadingParameters::READ_SIZE)?;
        decoded(ShadingParameters::table_from_bytes(&data))
    }

    /// Read `lines` scan lines totalling `bytes` bytes.
    pub fn get_scanned_lines(&self, lines: u16, bytes: usize) -> Result<Vec<u8>, CommandOutcome> {
        self.execute(&CommandFrame::read_with_size(SCSI_READ, lines, bytes))
    }

    pub fn get_parameters(&self) -> Result<ScanParameters, CommandOutcome> {
        let data = self.execute(&CommandFrame::read(SCSI_PARAM, ScanParameters::SIZE))?;
        decoded(ScanParameters::from_bytes(&data))
    }

    pub fn set_mode(&self, mode: &Mode) -> Result<(), CommandOutcome> {
        let payload = mode.to_bytes().map_err(|e| {
            error!(error = %e, "Mode rejected");
            CommandOutcome::Unsupported
        })?;
        info!(
            resolution = mode.resolution,
            passes = %format!("0x{:02X}", mode.passes),
            depth = mode.color_depth,
            format = %format!("0x{:02X}", mode.color_format),
            "Set mode"
        );
        self.execute(&CommandFrame::write(SCSI_MODE_SELECT, payload))
            .map(|_| ())
    }

    pub fn get_mode(&self) -> Result<Mode, CommandOutcome> {
        let data = self.execute(&CommandFrame::read(SCSI_MODE_SENSE, Mode::SIZE))?;
        decoded(Mode::from_bytes(&data))
    }

    pub fn get_ccd_mask(&self, size: usize) -> Result<Vec<u8>, CommandOutcome> {
        self.execute(&CommandFrame::read(SCSI_COPY, size))
    }

    pub fn start_scan(&self) -> Result<(), CommandOutcome> {
        self.execute(&CommandFrame::new(SCSI_SCAN, 1)).map(|_| ())
    }

    pub fn stop_scan(&self) -> Result<(), CommandOutcome> {
        self.execute(&CommandFrame::new(SCSI_SCAN, 0)).map(|_| ())
    }

    /// Move the scan head. Mode 2 is not supported by the firmware.
    pub fn set_scan_head(&self, mode: u8, steps: u16) -> Result<(), CommandOutcome> {
        let payload = records::scan_head(mode, steps).ok_or_else(|| {
            error!(mode, "Unsupported scan head mode");
            CommandOutcome::Invalid
        })?;
        self.execute(&CommandFrame::write(SCSI_SET_SCAN_HEAD, payload))
            .map(|_| ())
    }

    /// Read back gain/offset; fields not reported keep the values of `base`.
    pub fn get_gain_offset(&self, base: &Settings) -> Result<Settings, CommandOutcome> {
        let data = self.execute(&CommandFrame::read(
            SCSI_READ_GAIN_OFFSET,
            Settings::READ_SIZE,
        ))?;
        let settings = decoded(Settings::from_bytes(&data, base))?;
        debug!(?settings, "Gain/offset read");
        Ok(settings)
    }

    pub fn set_gain_offset(&self, settings: &Settings) -> Result<(), CommandOutcome> {
        debug!(?settings, "Gain/offset write");
        self.execute(&CommandFrame::write(
            SCSI_WRITE_GAIN_OFFSET,
            settings.to_bytes(),
        ))
        .map(|_| ())
    }

    /// READ STATE. A busy or warming-up device reads as warming up.
    pub fn read_state(&self) -> Result<ScannerState, CommandOutcome> {
        match self.execute(&CommandFrame::read(SCSI_READ_STATE, ScannerState::SIZE)) {
            Ok(data) => decoded(ScannerState::from_bytes(&data)),
            Err(CommandOutcome::WarmingUp) | Err(CommandOutcome::DeviceBusy) => {
                Ok(ScannerState {
                    warming_up: true,
                    ..Default::default()
                })
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineTiming;
    use crate::transport::MockTransport;
    use byteorder::{ByteOrder, LittleEndian};

    fn engine() -> (CommandEngine<MockTransport>, MockTransport) {
        let mock = MockTransport::new();
        (
            CommandEngine::with_timing(mock.clone(), EngineTiming::immediate()),
            mock,
        )
    }

    #[test]
    fn test_exposure_writes_one_command_per_filter() {
        let (engine, mock) = engine();
        engine.set_exposure_time([100, 100, 100]).unwrap();
        let writes = mock.commands_with_opcode(SCSI_WRITE);
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].payload, vec![0x13, 0, 4, 0, 2, 0, 100, 0]);
        assert_eq!(writes[1].payload[4], 4);
        assert_eq!(writes[2].payload[4], 8);
    }

    #[test]
    fn test_get_scan_frame_prepares_then_reads() {
        let (engine, mock) = engine();
        let mut data = vec![0u8; 256];
        data[4] = 0x80;
        LittleEndian::write_u16(&mut data[10..], 1200);
        mock.queue_data(SCSI_READ, &data);

        let frame = engine.get_scan_frame(0x80).unwrap();
        assert_eq!(frame.index, 0x80);
        assert_eq!(frame.x1, 1200);

        let cmds = mock.commands();
        assert_eq!(cmds[0].opcode(), SCSI_WRITE);
        assert_eq!(cmds[0].payload, vec![0x92, 0, 0, 0, 0x80, 0]);
        assert_eq!(cmds[1].opcode(), SCSI_READ);
        assert_eq!(cmds[1].size(), 256);
    }

    #[test]
    fn test_read_state_converts_warming_up() {
        let (engine, mock) = engine();
        mock.queue_status(SCSI_READ_STATE, &[USB_STATUS_CHECK]);
        let mut sense = vec![0u8; SENSE_LEN];
        sense[2] = 0x02;
        sense[12] = 0x04;
        sense[13] = 0x01;
        mock.queue_data(SCSI_REQUEST_SENSE, &sense);

        let state = engine.read_state().unwrap();
        assert!(state.warming_up);
    }

    #[test]
    fn test_read_state_decodes_flags() {
        let (engine, mock) = engine();
        mock.queue_data(SCSI_READ_STATE, &[1, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0]);
        let state = engine.read_state().unwrap();
        assert!(state.button_pushed);
        assert!(!state.warming_up);
        assert!(state.scanning);
    }

    #[test]
    fn test_scan_head_mode_two_never_reaches_device() {
        let (engine, mock) = engine();
        assert_eq!(engine.set_scan_head(2, 0), Err(CommandOutcome::Invalid));
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_set_mode_rejects_bad_depth_before_io() {
        let (engine, mock) = engine();
        let mode = Mode {
            color_depth: 3,
            ..Default::default()
        };
        assert_eq!(engine.set_mode(&mode), Err(CommandOutcome::Unsupported));
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_start_and_stop_scan_size_field() {
        let (engine, mock) = engine();
        engine.start_scan().unwrap();
        engine.stop_scan().unwrap();
        let cmds = mock.commands_with_opcode(SCSI_SCAN);
        assert_eq!(cmds[0].size(), 1);
        assert_eq!(cmds[1].size(), 0);
    }

    #[test]
    fn test_short_inquiry_is_zero_extended() {
        let (engine, mock) = engine();
        let mut data = vec![0u8; 5];
        data[0] = 0x06;
        mock.queue_data(SCSI_INQUIRY, &data);
        let props = engine.inquiry(5).unwrap();
        assert_eq!(props.device_type, 0x06);
        assert_eq!(props.model, 0);
    }
}
