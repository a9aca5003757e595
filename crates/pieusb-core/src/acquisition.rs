//! Device work of the individual scan phases: readiness polling, shading
//! strip, CCD mask and line transfer.

use std::path::Path;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, instrument, trace, warn};

use crate::buffer::{BufferError, SampleBuffer};
use crate::config::TimingConfig;
use crate::engine::CommandEngine;
use crate::protocol::constants::*;
use crate::protocol::{CommandOutcome, ScanParameters};
use crate::shading::{ShadingLayout, ShadingReference};
use crate::state::CancelHandle;
use crate::transport::UsbTransport;

/// File name of the CCD mask dump.
pub const CCD_MASK_FILE: &str = "pieusb.ccd";
/// File name of the raw shading data dump.
pub const SHADING_FILE: &str = "pieusb.shading";

/// Poll until the device reports ready.
///
/// A device that is busy or warming up is polled again after the poll
/// interval; once the deadline passes the outcome is `DeviceBusy`. A
/// cancel request ends the wait with `Cancelled`.
#[instrument(level = "debug", skip_all)]
pub fn wait_ready<T: UsbTransport>(
    engine: &CommandEngine<T>,
    timing: &TimingConfig,
    cancel: &CancelHandle,
) -> Result<(), CommandOutcome> {
    let start = Instant::now();
    let mut polls = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(CommandOutcome::Cancelled);
        }
        polls += 1;
        match engine.test_unit_ready() {
            CommandOutcome::Good => {
                trace!(polls, "Device ready");
                return Ok(());
            }
            CommandOutcome::IoError => return Err(CommandOutcome::IoError),
            outcome => debug!(%outcome, "Device not ready"),
        }
        match engine.read_state() {
            Ok(state) if state.warming_up => {}
            Ok(_) => return Ok(()),
            Err(outcome) => return Err(outcome),
        }
        if start.elapsed() >= timing.ready_deadline {
            warn!(
                polls,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Device not ready before deadline"
            );
            return Err(CommandOutcome::DeviceBusy);
        }
        if polls % 5 == 0 {
            info!(polls, "Still waiting for the scanner to get ready");
        }
        thread::sleep(timing.ready_poll);
    }
}

/// Read the calibration strip and reduce it to a shading reference.
///
/// The device sends a short first burst; the remainder is only available
/// after it is ready again.
#[instrument(level = "debug", skip(engine, timing, cancel, dump_dir))]
pub fn read_shading<T: UsbTransport>(
    engine: &CommandEngine<T>,
    timing: &TimingConfig,
    cancel: &CancelHandle,
    width: usize,
    n_lines: usize,
    color_format: u8,
    dump_dir: Option<&Path>,
) -> Result<ShadingReference, ShadingFailure> {
    let layout = ShadingLayout::new(width, n_lines, color_format)?;
    let first = SHADING_FIRST_BURST.min(layout.lines);
    let mut raw = engine
        .get_scanned_lines(first as u16, first * layout.line_bytes)
        .map_err(ShadingFailure::Device)?;
    wait_ready(engine, timing, cancel).map_err(ShadingFailure::Device)?;

    let rest = layout.lines - first;
    if rest > 0 {
        let tail = engine
            .get_scanned_lines(rest as u16, rest * layout.line_bytes)
            .map_err(ShadingFailure::Device)?;
        raw.extend_from_slice(&tail);
    }
    debug!(bytes = raw.len(), lines = layout.lines, "Shading data read");

    if let Some(dir) = dump_dir {
        dump(dir, SHADING_FILE, &raw);
    }
    Ok(ShadingReference::calculate(&raw, width, n_lines, color_format)?)
}

/// Why reading the shading strip failed.
#[derive(Debug, thiserror::Error)]
pub enum ShadingFailure {
    #[error("Shading read failed: {0}")]
    Device(CommandOutcome),

    #[error(transparent)]
    Data(#[from] crate::shading::ShadingError),
}

/// Read the CCD mask; entries equal to [`CCD_PIXEL_USED`] are usable.
#[instrument(level = "debug", skip(engine, dump_dir))]
pub fn read_ccd_mask<T: UsbTransport>(
    engine: &CommandEngine<T>,
    size: usize,
    dump_dir: Option<&Path>,
) -> Result<Vec<u8>, CommandOutcome> {
    let mut mask = engine.get_ccd_mask(size)?;
    mask.resize(size, CCD_PIXEL_UNUSED);
    let used = mask.iter().filter(|&&m| m == CCD_PIXEL_USED).count();
    debug!(size, used, "CCD mask read");
    if let Some(dir) = dump_dir {
        dump(dir, CCD_MASK_FILE, &mask);
    }
    Ok(mask)
}

/// Diagnostic dumps never fail a scan.
fn dump(dir: &Path, name: &str, data: &[u8]) {
    let path = dir.join(name);
    match std::fs::write(&path, data) {
        Ok(()) => info!(path = %path.display(), bytes = data.len(), "Diagnostic data saved"),
        Err(e) => warn!(path = %path.display(), error = %e, "Could not save diagnostic data"),
    }
}

/// How a line transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Complete(TransferStats),
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub lines_read: usize,
    /// Lines dropped because their plane was already full.
    pub lines_discarded: usize,
    /// Index lines with an unknown colour tag.
    pub lines_unknown: usize,
}

/// Why a line transfer failed.
#[derive(Debug, thiserror::Error)]
pub enum TransferFailure {
    #[error("Reading scan lines failed: {0}")]
    Device(CommandOutcome),

    #[error("Color format 0x{0:02X} is not supported")]
    UnsupportedFormat(u8),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Move samples of the only scanned colour together when the device sends
/// three colour slots per pixel.
fn compact_single_color(line: &mut [u8], packet_size: usize, packets: usize) {
    for k in 0..packets {
        for i in 0..packet_size {
            line[packet_size * k + i] = line[3 * packet_size * k + i];
        }
    }
}

/// Read every scan line into `buffer`.
///
/// Lines are requested in batches of at most 255; the cancel flag is
/// checked before each batch. Lines the buffer has no room for are dropped
/// with a warning.
#[instrument(level = "info", skip(engine, buffer, params, cancel, progress), fields(lines = params.lines, bytes = params.bytes))]
pub fn read_lines<T: UsbTransport>(
    engine: &CommandEngine<T>,
    buffer: &mut SampleBuffer,
    params: &ScanParameters,
    color_format: u8,
    cancel: &CancelHandle,
    mut progress: impl FnMut(u64, u64),
) -> Result<Transfer, TransferFailure> {
    let (lines_to_read, bpl) = match color_format {
        FORMAT_PIXEL => (buffer.height(), params.bytes as usize),
        FORMAT_INDEX => (buffer.colors() * buffer.height(), params.bytes as usize + 2),
        other => return Err(TransferFailure::UnsupportedFormat(other)),
    };
    let ppl = buffer.width().max(1);
    let compress = color_format == FORMAT_PIXEL
        && buffer.colors() == 1
        && bpl * buffer.packing_density() / ppl == 3 * buffer.packet_size_bytes();
    let line_size = buffer.line_size_bytes();
    let packets = line_size / buffer.packet_size_bytes();
    debug!(lines_to_read, bpl, compress, "Line transfer");

    let mut stats = TransferStats::default();
    let mut remaining = lines_to_read;
    while remaining > 0 {
        if cancel.is_cancelled() {
            info!(remaining, "Transfer cancelled");
            return Ok(Transfer::Cancelled);
        }
        let lines = if remaining < 256 { remaining } else { MAX_LINES_PER_READ };
        let mut data = engine
            .get_scanned_lines(lines as u16, lines * bpl)
            .map_err(TransferFailure::Device)?;
        if data.len() < lines * bpl {
            warn!(
                expected = lines * bpl,
                actual = data.len(),
                "Short line batch"
            );
        }

        for line in data.chunks_exact_mut(bpl) {
            let result = match color_format {
                FORMAT_PIXEL if compress => {
                    compact_single_color(line, buffer.packet_size_bytes(), packets);
                    buffer.put_full_color_line(&line[..line_size])
                }
                FORMAT_PIXEL => {
                    let full = line_size * buffer.colors();
                    buffer.put_full_color_line(&line[..full.min(line.len())])
                }
                _ => {
                    let samples = &line[2..];
                    buffer.put_indexed_line(line[0], &samples[..line_size.min(samples.len())])
                }
            };
            match result {
                Ok(()) => stats.lines_read += 1,
                Err(BufferError::PlaneFull(color)) => {
                    stats.lines_discarded += 1;
                    warn!(color = %color, "Excess line discarded");
                }
                Err(BufferError::UnknownColor(tag)) => {
                    stats.lines_unknown += 1;
                    warn!(tag = %format!("0x{:02X}", tag), "Line with unknown color tag skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }

        remaining -= lines;
        progress((lines_to_read - remaining) as u64, lines_to_read as u64);
    }

    info!(
        lines = stats.lines_read,
        discarded = stats.lines_discarded,
        bytes = buffer.bytes_written(),
        "Transfer complete"
    );
    Ok(Transfer::Complete(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Color, ColorMask};
    use crate::transport::{MockReply, MockTransport};
    use std::time::Duration;
    use tempfile::tempdir;

    fn engine() -> (CommandEngine<MockTransport>, MockTransport) {
        let mock = MockTransport::new();
        (
            CommandEngine::with_timing(mock.clone(), TimingConfig::immediate().engine()),
            mock,
        )
    }

    fn indexed_line(tag: u8, value: u8, width: usize) -> Vec<u8> {
        let mut line = vec![tag, 0];
        line.extend(std::iter::repeat_n(value, width));
        line
    }

    #[test]
    fn test_wait_ready_immediately_good() {
        let (engine, mock) = engine();
        wait_ready(&engine, &TimingConfig::immediate(), &CancelHandle::new()).unwrap();
        assert_eq!(mock.commands_with_opcode(SCSI_TEST_UNIT_READY).len(), 1);
        assert!(mock.commands_with_opcode(SCSI_READ_STATE).is_empty());
    }

    #[test]
    fn test_wait_ready_polls_while_warming_up() {
        let (engine, mock) = engine();
        mock.queue_status(SCSI_TEST_UNIT_READY, &[USB_STATUS_CHECK]);
        let mut sense = vec![0u8; SENSE_LEN];
        sense[2] = 0x02;
        sense[12] = 0x04;
        sense[13] = 0x01;
        mock.queue_data(SCSI_REQUEST_SENSE, &sense);
        let mut state = vec![0u8; 12];
        state[5] = 1;
        mock.queue_data(SCSI_READ_STATE, &state);

        wait_ready(&engine, &TimingConfig::immediate(), &CancelHandle::new()).unwrap();
        assert_eq!(mock.commands_with_opcode(SCSI_TEST_UNIT_READY).len(), 2);
    }

    #[test]
    fn test_wait_ready_deadline_is_busy() {
        let (engine, mock) = engine();
        mock.set_always_busy(true);
        let timing = TimingConfig {
            command_timeout: Duration::from_millis(20),
            ready_deadline: Duration::from_millis(50),
            ..TimingConfig::immediate()
        };
        let start = Instant::now();
        let result = wait_ready(&engine, &timing, &CancelHandle::new());
        assert_eq!(result, Err(CommandOutcome::DeviceBusy));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_ready_observes_cancel() {
        let (engine, mock) = engine();
        let cancel = CancelHandle::new();
        cancel.cancel();
        assert_eq!(
            wait_ready(&engine, &TimingConfig::immediate(), &cancel),
            Err(CommandOutcome::Cancelled)
        );
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_shading_read_in_two_parts() {
        let (engine, mock) = engine();
        let width = 3;
        let n_lines = 2;
        // 8 index lines, each tag + pad + 3 samples of 16 bits
        let line = |tag: u8, v: u16| {
            let mut l = vec![tag, 0];
            for _ in 0..width {
                l.extend_from_slice(&v.to_le_bytes());
            }
            l
        };
        let tags = [b'R', b'G', b'B', b'I'];
        let mut first = Vec::new();
        for t in tags {
            first.extend(line(t, 1000));
        }
        let mut rest = Vec::new();
        for t in tags {
            rest.extend(line(t, 3000));
        }
        mock.queue_data(SCSI_READ, &first);
        mock.queue_data(SCSI_READ, &rest);

        let dir = tempdir().unwrap();
        let reference = read_shading(
            &engine,
            &TimingConfig::immediate(),
            &CancelHandle::new(),
            width,
            n_lines,
            FORMAT_INDEX,
            Some(dir.path()),
        )
        .unwrap();
        assert_eq!(reference.mean(Color::Green), 2000);

        let reads = mock.commands_with_opcode(SCSI_READ);
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].size(), 4);
        assert_eq!(reads[1].size(), 4);
        let dumped = std::fs::read(dir.path().join(SHADING_FILE)).unwrap();
        assert_eq!(dumped.len(), 8 * 8);
    }

    #[test]
    fn test_ccd_mask_dump() {
        let (engine, mock) = engine();
        mock.queue_data(SCSI_COPY, &[CCD_PIXEL_USED, CCD_PIXEL_UNUSED, CCD_PIXEL_USED, CCD_PIXEL_UNUSED]);
        let dir = tempdir().unwrap();
        let mask = read_ccd_mask(&engine, 4, Some(dir.path())).unwrap();
        assert_eq!(mask, vec![0x00, 0x70, 0x00, 0x70]);
        assert_eq!(std::fs::read(dir.path().join(CCD_MASK_FILE)).unwrap(), mask);
    }

    #[test]
    fn test_indexed_transfer_batches() {
        let (engine, mock) = engine();
        let width = 4;
        let height = 100;
        let mut buffer = SampleBuffer::new(width, height, ColorMask::RGB, 8).unwrap();
        let params = ScanParameters {
            width: width as u16,
            lines: height as u16,
            bytes: width as u16,
            ..Default::default()
        };
        // 300 lines: one batch of 255, one of 45
        let mut batch = Vec::new();
        for n in 0..255 {
            batch.extend(indexed_line([b'R', b'G', b'B'][n % 3], 10, width));
        }
        mock.queue_data(SCSI_READ, &batch);
        let mut batch = Vec::new();
        for n in 255..300 {
            batch.extend(indexed_line([b'R', b'G', b'B'][n % 3], 10, width));
        }
        mock.queue_data(SCSI_READ, &batch);

        let mut last = (0, 0);
        let result = read_lines(
            &engine,
            &mut buffer,
            &params,
            FORMAT_INDEX,
            &CancelHandle::new(),
            |c, t| last = (c, t),
        )
        .unwrap();
        assert!(matches!(result, Transfer::Complete(TransferStats { lines_read: 300, .. })));
        assert!(buffer.is_filled());
        assert_eq!(last, (300, 300));
        let sizes: Vec<u16> = mock.commands_with_opcode(SCSI_READ).iter().map(|c| c.size()).collect();
        assert_eq!(sizes, vec![255, 45]);
    }

    #[test]
    fn test_excess_lines_are_discarded() {
        let (engine, mock) = engine();
        let mut buffer = SampleBuffer::new(2, 1, ColorMask::RGB, 8).unwrap();
        let params = ScanParameters {
            width: 2,
            lines: 1,
            bytes: 2,
            ..Default::default()
        };
        let mut data = Vec::new();
        for tag in [b'R', b'R', b'G'] {
            data.extend(indexed_line(tag, 1, 2));
        }
        mock.queue_data(SCSI_READ, &data);
        let result = read_lines(&engine, &mut buffer, &params, FORMAT_INDEX, &CancelHandle::new(), |_, _| {}).unwrap();
        assert_eq!(
            result,
            Transfer::Complete(TransferStats {
                lines_read: 2,
                lines_discarded: 1,
                lines_unknown: 0,
            })
        );
    }

    #[test]
    fn test_pixel_format_compaction() {
        let (engine, mock) = engine();
        let mut buffer = SampleBuffer::new(3, 1, ColorMask::GREEN, 8).unwrap();
        let params = ScanParameters {
            width: 3,
            lines: 1,
            bytes: 9,
            ..Default::default()
        };
        mock.queue_data(SCSI_READ, &[1, 0, 0, 2, 0, 0, 3, 0, 0]);
        read_lines(&engine, &mut buffer, &params, FORMAT_PIXEL, &CancelHandle::new(), |_, _| {}).unwrap();
        assert_eq!(buffer.plane(Color::Green).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_transfer_cancel_before_batch() {
        let (engine, mock) = engine();
        let mut buffer = SampleBuffer::new(2, 2, ColorMask::RGB, 8).unwrap();
        let params = ScanParameters {
            width: 2,
            lines: 2,
            bytes: 2,
            ..Default::default()
        };
        let cancel = CancelHandle::new();
        cancel.cancel();
        let result = read_lines(&engine, &mut buffer, &params, FORMAT_INDEX, &cancel, |_, _| {}).unwrap();
        assert_eq!(result, Transfer::Cancelled);
        assert!(mock.commands_with_opcode(SCSI_READ).is_empty());
    }

    #[test]
    fn test_failed_read_is_reported() {
        let (engine, mock) = engine();
        mock.queue_reply(SCSI_READ, MockReply::Status(vec![USB_STATUS_ERROR]));
        let mut buffer = SampleBuffer::new(2, 1, ColorMask::GREEN, 8).unwrap();
        let params = ScanParameters {
            width: 2,
            lines: 1,
            bytes: 6,
            ..Default::default()
        };
        let result = read_lines(&engine, &mut buffer, &params, FORMAT_PIXEL, &CancelHandle::new(), |_, _| {});
        assert!(matches!(result, Err(TransferFailure::Device(_))));
    }
}
