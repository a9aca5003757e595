//! Scan session - the caller facing API of one opened scanner.
//!
//! A session owns the command engine, the device definition and the option
//! store. `start` runs one exposure through warm-up, configuration,
//! calibration, mask acquisition, transfer and post-processing; `read`
//! then hands the image out in caller sized chunks.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::acquisition::{self, ShadingFailure, Transfer, TransferFailure};
use crate::buffer::{BufferError, Color, SampleBuffer};
use crate::calibration::{self, CalibrationMode, PreviewStats};
use crate::config::{ScanConfig, TimingConfig};
use crate::device::{DeviceDefinition, SupportedDevice};
use crate::engine::CommandEngine;
use crate::events::{Operation, ScanEvent, ScanObserver, TracingObserver};
use crate::ir::CropEdges;
use crate::options::{ImageParameters, OptionError, OptionId, OptionValue, ScanMode, ScanOptions};
use crate::postprocess::{self, PostprocessError};
use crate::protocol::constants::*;
use crate::protocol::{
    CommandOutcome, HalftonePattern, Mode, ScanFrame, ScanParameters, ScannerProperties,
    ScannerState, Settings,
};
use crate::shading::{ShadingError, ShadingReference};
use crate::state::{CancelHandle, ScanContext, ScanState};
use crate::transport::{NusbTransport, TransportError, UsbTransport};

/// Allocation length of the first, short INQUIRY.
const INQUIRY_HEADER_LEN: u8 = 5;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{operation} failed: {outcome}")]
    Device {
        operation: &'static str,
        outcome: CommandOutcome,
    },

    #[error(transparent)]
    Options(#[from] OptionError),

    #[error(transparent)]
    Shading(#[from] ShadingError),

    #[error(transparent)]
    Postprocess(PostprocessError),

    #[error("Out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },

    #[error(transparent)]
    Buffer(BufferError),

    #[error("Unsupported scanner model 0x{model:02X} ({vendor_id:04X}:{product_id:04X})")]
    UnsupportedModel {
        vendor_id: u16,
        product_id: u16,
        model: u16,
    },

    #[error("No scan in progress")]
    NotScanning,

    #[error("Image incomplete: {read} of {expected} bytes delivered")]
    Incomplete { read: usize, expected: usize },

    /// Only used inside the session; callers see `StartStatus::Cancelled`
    /// or `ReadStatus::Cancelled` instead.
    #[error("Scan cancelled")]
    Cancelled,
}

impl From<BufferError> for SessionError {
    fn from(e: BufferError) -> Self {
        match e {
            BufferError::OutOfMemory { bytes } => SessionError::OutOfMemory { bytes },
            other => SessionError::Buffer(other),
        }
    }
}

impl SessionError {
    /// Device outcome behind the error, if any.
    pub fn outcome(&self) -> Option<&CommandOutcome> {
        match self {
            SessionError::Device { outcome, .. } => Some(outcome),
            _ => None,
        }
    }

    /// The device was busy or still warming up; trying again later may help.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.outcome(),
            Some(CommandOutcome::DeviceBusy | CommandOutcome::WarmingUp)
        )
    }
}

/// Map a non-Good outcome of `operation` to a session error.
fn device(operation: &'static str) -> impl FnOnce(CommandOutcome) -> SessionError {
    move |outcome| match outcome {
        CommandOutcome::Cancelled => SessionError::Cancelled,
        outcome => {
            error!(operation, outcome = %outcome, "Device command failed");
            SessionError::Device { operation, outcome }
        }
    }
}

/// Like [`device`], but any failure while pushing the scan setup ends the
/// session with `IoError`. The device's own outcome only reaches the log.
fn configuring(operation: &'static str) -> impl FnOnce(CommandOutcome) -> SessionError {
    move |outcome| match outcome {
        CommandOutcome::Cancelled => SessionError::Cancelled,
        outcome => {
            error!(operation, outcome = %outcome, "Configuring the scan failed");
            SessionError::Device {
                operation,
                outcome: CommandOutcome::IoError,
            }
        }
    }
}

/// How `start` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    /// The image is acquired and can be read.
    Ready(ImageParameters),
    /// The scan was cancelled; the session is idle again.
    Cancelled,
}

/// Result of one `read` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStatus {
    Data(Vec<u8>),
    /// The whole image was delivered.
    EndOfData,
    /// The scan was cancelled and its data discarded.
    Cancelled,
}

/// One opened scanner.
pub struct ScanSession<T: UsbTransport, O: ScanObserver = TracingObserver> {
    engine: CommandEngine<T>,
    device: DeviceDefinition,
    options: ScanOptions,
    timing: TimingConfig,
    observer: Arc<O>,
    ctx: ScanContext,
    settings: Settings,
    /// Mode block of the running or last scan.
    mode: Option<Mode>,
    /// Transfer parameters reported by the device for the running scan.
    scan_parameters: Option<ScanParameters>,
    shading_width: usize,
    shading_lines: usize,
    shading: Option<ShadingReference>,
    ccd_mask: Vec<u8>,
    preview: Option<PreviewStats>,
    crop: Option<CropEdges>,
    buffer: Option<SampleBuffer>,
    /// The last scan ended by cancellation and no `read` has reported it.
    cancelled: bool,
}

impl ScanSession<NusbTransport, TracingObserver> {
    /// Open the first attached scanner the configuration accepts.
    pub fn open_usb(config: &ScanConfig) -> Result<Self, SessionError> {
        let transport = NusbTransport::open(&config.device.candidates())?;
        Self::open(transport, config)
    }
}

impl<T: UsbTransport> ScanSession<T, TracingObserver> {
    /// Open a session with the default tracing observer.
    pub fn open(transport: T, config: &ScanConfig) -> Result<Self, SessionError> {
        Self::with_observer(transport, config, Arc::new(TracingObserver))
    }
}

impl<T: UsbTransport, O: ScanObserver> ScanSession<T, O> {
    /// Identify the scanner behind `transport` and wait until it is ready.
    #[instrument(level = "info", skip_all)]
    pub fn with_observer(
        transport: T,
        config: &ScanConfig,
        observer: Arc<O>,
    ) -> Result<Self, SessionError> {
        let engine = CommandEngine::with_timing(transport, config.timing.engine());
        let vendor_id = engine.transport().vendor_id();
        let product_id = engine.transport().product_id();

        let props = inquire(&engine)?;
        if !model_supported(&config.device.candidates(), vendor_id, product_id, props.model) {
            error!(
                vid = %format!("{:04X}", vendor_id),
                pid = %format!("{:04X}", product_id),
                model = %format!("0x{:02X}", props.model),
                "Wrong model number"
            );
            return Err(SessionError::UnsupportedModel {
                vendor_id,
                product_id,
                model: props.model,
            });
        }

        let device = DeviceDefinition::from_inquiry(&props, vendor_id, product_id);
        observer.on_event(&ScanEvent::DeviceConnected {
            vid: vendor_id,
            pid: product_id,
            product: device.product.clone(),
        });

        let mut options = config.options();
        options.resolve(&device);

        let session = Self {
            engine,
            device,
            options,
            timing: config.timing,
            observer,
            ctx: ScanContext::new(),
            settings: Settings::default(),
            mode: None,
            scan_parameters: None,
            shading_width: 0,
            shading_lines: 0,
            shading: None,
            ccd_mask: Vec::new(),
            preview: None,
            crop: None,
            buffer: None,
            cancelled: false,
        };
        session.wait_ready()?;
        Ok(session)
    }

    pub fn device(&self) -> &DeviceDefinition {
        &self.device
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn state(&self) -> ScanState {
        self.ctx.state
    }

    pub fn is_scanning(&self) -> bool {
        self.ctx.scanning
    }

    /// Gain, offset and exposure last sent to the device.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn preview_stats(&self) -> Option<&PreviewStats> {
        self.preview.as_ref()
    }

    pub fn shading_reference(&self) -> Option<&ShadingReference> {
        self.shading.as_ref()
    }

    /// Crop rectangle suggested by the last image cleaning, never applied.
    pub fn crop_suggestion(&self) -> Option<CropEdges> {
        self.crop
    }

    /// Handle another thread can use to cancel the running scan.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.ctx.cancel.clone()
    }

    /// Replace all options. Device dependent defaults are filled in and the
    /// result is checked before it is accepted.
    pub fn configure(&mut self, mut options: ScanOptions) -> Result<(), SessionError> {
        self.ensure_idle("configure")?;
        options.resolve(&self.device);
        options.effective_depth()?;
        options.analyse(&self.device)?;
        self.options = options;
        Ok(())
    }

    pub fn get_option(&self, id: OptionId) -> OptionValue {
        self.options.get(id)
    }

    pub fn set_option(&mut self, id: OptionId, value: OptionValue) -> Result<(), SessionError> {
        self.ensure_idle("set option")?;
        self.options.set(id, value)?;
        Ok(())
    }

    /// Apply a `name=value` assignment.
    pub fn set_option_str(&mut self, assignment: &str) -> Result<OptionId, SessionError> {
        self.ensure_idle("set option")?;
        Ok(self.options.set_from_str(assignment)?)
    }

    fn ensure_idle(&self, operation: &'static str) -> Result<(), SessionError> {
        if self.ctx.scanning {
            warn!(operation, "Scanner is busy scanning");
            return Err(SessionError::Device {
                operation,
                outcome: CommandOutcome::DeviceBusy,
            });
        }
        Ok(())
    }

    /// Parameters of the running scan as reported by the device, or an
    /// estimate from the options before a scan.
    pub fn parameters(&self) -> Result<ImageParameters, SessionError> {
        match (&self.scan_parameters, &self.mode) {
            (Some(params), Some(mode)) if self.ctx.scanning => Ok(ImageParameters::from_device(
                params,
                self.options.frame_format(),
                mode.color_depth,
            )),
            _ => Ok(self.options.estimate_parameters(&self.device)?),
        }
    }

    fn goto_state(&mut self, next: ScanState) {
        let from = self.ctx.goto_state(next);
        if from != next {
            self.observer
                .on_event(&ScanEvent::StateChanged { from, to: next });
        }
    }

    fn wait_ready(&self) -> Result<(), SessionError> {
        acquisition::wait_ready(&self.engine, &self.timing, &self.ctx.cancel)
            .map_err(device("wait ready"))
    }

    /// Acquire one image.
    ///
    /// Busy and warming-up devices are reported as errors for which
    /// [`SessionError::is_busy`] holds; the caller may retry.
    #[instrument(level = "info", skip(self))]
    pub fn start(&mut self) -> Result<StartStatus, SessionError> {
        if self.ctx.scanning {
            error!("Scanner is already scanning");
            return Err(SessionError::Device {
                operation: "start",
                outcome: CommandOutcome::DeviceBusy,
            });
        }
        self.ctx.cancel.reset();
        self.cancelled = false;
        self.crop = None;

        match self.run_scan() {
            Ok(params) => {
                self.goto_state(ScanState::Delivering);
                Ok(StartStatus::Ready(params))
            }
            Err(SessionError::Cancelled) => {
                self.on_cancel();
                Ok(StartStatus::Cancelled)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn run_scan(&mut self) -> Result<ImageParameters, SessionError> {
        // Configuration errors never reach the device.
        self.options.effective_depth()?;
        let mode = self.options.mode_block(&self.device)?;

        self.goto_state(ScanState::WarmingUp);
        let state = self.engine.read_state().map_err(device("read state"))?;
        if state.warming_up {
            warn!("Scanner is warming up");
            thread::sleep(self.timing.warm_up_delay);
            return Err(SessionError::Device {
                operation: "start",
                outcome: CommandOutcome::DeviceBusy,
            });
        }

        self.goto_state(ScanState::Configuring);
        let filter_defaults = [DEFAULT_FILTER_SETTING; 3];
        self.engine
            .set_exposure_time(filter_defaults)
            .map_err(configuring("set exposure time"))?;
        self.engine
            .set_highlight_shadow(filter_defaults)
            .map_err(configuring("set highlight/shadow"))?;
        let shading_parameters = self
            .engine
            .get_shading_parameters()
            .map_err(configuring("get shading parameters"))?;
        let Some(first) = shading_parameters.first() else {
            error!("Device reported no shading parameters");
            return Err(configuring("get shading parameters")(CommandOutcome::Invalid));
        };
        self.shading_width = first.pixels_per_line as usize;
        self.shading_lines = first.n_lines as usize;
        debug!(
            width = self.shading_width,
            lines = self.shading_lines,
            "Shading geometry"
        );

        self.options.analyse(&self.device)?;
        self.engine
            .set_scan_frame(&self.options.frame(&self.device))
            .map_err(configuring("set scan frame"))?;
        self.engine.cmd_17(1).map_err(configuring("command 17"))?;
        self.wait_ready()?;

        self.apply_calibration(mode.passes)?;
        self.wait_ready()?;

        self.engine.set_mode(&mode).map_err(configuring("set mode"))?;
        self.mode = Some(mode);
        self.engine.slide(SLIDE_LAMP_ON).map_err(configuring("lamp on"))?;
        self.wait_ready()?;

        self.ctx.scanning = true;
        let must_calibrate = self.start_device()?;

        if must_calibrate || self.options.scan.shading_analysis {
            self.goto_state(ScanState::Calibrating);
            info!(must_calibrate, "Processing shading data");
            self.apply_calibration(mode.passes)?;
            self.read_shading(mode.color_format)?;
        }
        self.wait_ready()?;
        if self.ctx.cancel_requested() {
            return Err(SessionError::Cancelled);
        }

        self.goto_state(ScanState::MaskAcquiring);
        let dump = self.dump_dir(self.options.diagnostics.save_ccd_mask);
        self.ccd_mask = acquisition::read_ccd_mask(&self.engine, self.shading_width, dump.as_deref())
            .map_err(device("get CCD mask"))?;

        let params = self
            .engine
            .get_parameters()
            .map_err(device("get parameters"))?;
        info!(
            width = params.width,
            lines = params.lines,
            bytes = params.bytes,
            "Scan parameters"
        );
        self.scan_parameters = Some(params);
        self.wait_ready()?;

        self.goto_state(ScanState::Transferring);
        let mut buffer = SampleBuffer::new(
            params.width as usize,
            params.lines as usize,
            self.options.color_mask(),
            mode.color_depth,
        )?;
        self.transfer(&mut buffer, &params, mode.color_format)?;
        thread::sleep(self.timing.settle_delay);
        self.wait_ready()?;

        if self.options.scan.advance_slide && !self.options.scan.preview {
            if let Err(outcome) = self.engine.slide(SLIDE_NEXT) {
                warn!(outcome = %outcome, "Advancing to the next slide failed");
            }
        }

        self.goto_state(ScanState::PostProcessing);
        self.postprocess(&mut buffer)?;

        let bytes = buffer.image_size_bytes();
        self.buffer = Some(buffer);
        self.observer.on_event(&ScanEvent::ImageReady { bytes });
        self.parameters()
    }

    /// Issue SCAN while the device is warming up. Returns whether the
    /// device asked for calibration.
    fn start_device(&mut self) -> Result<bool, SessionError> {
        let deadline = Instant::now() + self.timing.ready_deadline;
        let must_calibrate = loop {
            match self.engine.start_scan() {
                Ok(()) => break false,
                Err(CommandOutcome::MustCalibrate) => break true,
                Err(CommandOutcome::WarmingUp) if Instant::now() < deadline => {
                    if self.ctx.cancel_requested() {
                        return Err(SessionError::Cancelled);
                    }
                    info!("Scanner warming up, retrying start");
                    thread::sleep(self.timing.start_retry);
                }
                Err(outcome) => return Err(device("start scan")(outcome)),
            }
        };
        self.wait_ready()?;
        Ok(must_calibrate)
    }

    /// Set gain, offset and exposure from the configured calibration source,
    /// apply the gain adjustment and send the result.
    fn apply_calibration(&mut self, passes: u8) -> Result<(), SessionError> {
        let calibration = self.options.calibration;
        info!(source = %calibration.mode, "Setting gain and offset");
        let fetched = match (calibration.mode, self.preview) {
            (CalibrationMode::Default, _) => {
                calibration::apply_defaults(&mut self.settings);
                Ok(())
            }
            (CalibrationMode::Options, _) => {
                calibration::apply_manual(&mut self.settings, &calibration.manual);
                Ok(())
            }
            (CalibrationMode::Preview, Some(stats)) => {
                match self.engine.get_gain_offset(&self.settings) {
                    Ok(current) => {
                        self.settings.saturation_level = current.saturation_level;
                        self.settings.exposure_time = stats.exposure;
                        self.settings.gain = stats.gain;
                        self.settings.offset = stats.offset;
                        stats.apply(&mut self.settings, passes);
                        Ok(())
                    }
                    Err(outcome) => Err(outcome),
                }
            }
            (CalibrationMode::Auto | CalibrationMode::Preview, _) => {
                match self.engine.get_gain_offset(&self.settings) {
                    Ok(current) => {
                        self.settings = current;
                        Ok(())
                    }
                    Err(outcome) => Err(outcome),
                }
            }
        };
        match fetched {
            Ok(()) => {}
            Err(CommandOutcome::DeviceBusy) => self.wait_ready()?,
            Err(outcome) => {
                error!(outcome = %outcome, "Reading gain and offset failed");
                return Err(SessionError::Device {
                    operation: "get gain/offset",
                    outcome: CommandOutcome::Invalid,
                });
            }
        }

        calibration::apply_gain_adjust(&mut self.settings, calibration.gain_adjust, passes);
        self.engine
            .set_gain_offset(&self.settings)
            .map_err(device("set gain/offset"))
    }

    fn dump_dir(&self, enabled: bool) -> Option<PathBuf> {
        enabled.then(|| {
            self.options
                .diagnostics
                .dump_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }

    fn read_shading(&mut self, color_format: u8) -> Result<(), SessionError> {
        let dump = self.dump_dir(self.options.diagnostics.save_shading);
        self.observer.on_event(&ScanEvent::Progress {
            operation: Operation::ShadingData,
            current: 0,
            total: self.shading_lines as u64,
        });
        let reference = acquisition::read_shading(
            &self.engine,
            &self.timing,
            &self.ctx.cancel,
            self.shading_width,
            self.shading_lines,
            color_format,
            dump.as_deref(),
        )
        .map_err(|e| match e {
            ShadingFailure::Device(outcome) => device("get shading data")(outcome),
            ShadingFailure::Data(e) => SessionError::Shading(e),
        })?;
        self.shading = Some(reference);
        self.ctx.shading_present = true;
        self.observer.on_event(&ScanEvent::Progress {
            operation: Operation::ShadingData,
            current: self.shading_lines as u64,
            total: self.shading_lines as u64,
        });
        Ok(())
    }

    fn transfer(
        &self,
        buffer: &mut SampleBuffer,
        params: &ScanParameters,
        color_format: u8,
    ) -> Result<(), SessionError> {
        let observer = &self.observer;
        let result = acquisition::read_lines(
            &self.engine,
            buffer,
            params,
            color_format,
            &self.ctx.cancel,
            |current, total| {
                observer.on_event(&ScanEvent::Progress {
                    operation: Operation::LineTransfer,
                    current,
                    total,
                })
            },
        );
        match result {
            Ok(Transfer::Complete(stats)) => {
                if !buffer.is_filled() {
                    warn!(
                        written = buffer.bytes_written(),
                        expected = buffer.image_size_bytes(),
                        "Image not completely filled"
                    );
                }
                debug!(?stats, "Lines transferred");
                Ok(())
            }
            Ok(Transfer::Cancelled) => Err(SessionError::Cancelled),
            Err(TransferFailure::Device(outcome)) => Err(device("read scan lines")(outcome)),
            Err(TransferFailure::UnsupportedFormat(format)) => {
                error!(format = %format!("0x{:02X}", format), "Unsupported color format");
                Err(SessionError::Device {
                    operation: "read scan lines",
                    outcome: CommandOutcome::Unsupported,
                })
            }
            Err(TransferFailure::Buffer(e)) => Err(e.into()),
        }
    }

    /// Shading correction, infrared cleaning and preview analysis.
    fn postprocess(&mut self, buffer: &mut SampleBuffer) -> Result<(), SessionError> {
        let scan = &self.options.scan;
        let config = &self.options.postprocess;

        if config.correct_shading && !scan.mode.is_binary() {
            match &self.shading {
                Some(reference) if self.ctx.shading_present => {
                    reference.correct(buffer, &self.ccd_mask);
                }
                _ => warn!("Unable to correct for shading, no shading data available"),
            }
        }

        if config.wants_infrared()
            && !scan.preview
            && buffer.color_mask().contains(Color::Infrared)
        {
            let mut rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let cancel = self.ctx.cancel.clone();
            let resolution = self.options.effective_resolution(&self.device);
            match postprocess::run(buffer, resolution, config, || cancel.is_cancelled(), &mut rng) {
                Ok(report) => {
                    if let Some(edges) = report.crop {
                        self.observer.on_event(&ScanEvent::CropSuggested(edges));
                    }
                    self.crop = report.crop;
                }
                Err(PostprocessError::Cancelled) => return Err(SessionError::Cancelled),
                Err(e) => return Err(SessionError::Postprocess(e)),
            }
        }

        if scan.preview {
            match PreviewStats::analyze(buffer, &self.settings) {
                Ok(stats) => self.preview = Some(stats),
                Err(e) => {
                    warn!(error = %e, "Preview analysis failed");
                    self.preview = None;
                }
            }
        } else {
            self.preview = None;
        }

        if scan.mode == ScanMode::Color
            && config.clean_image
            && !scan.preview
            && buffer.color_mask().contains(Color::Infrared)
        {
            buffer.drop_color(Color::Infrared)?;
        }
        Ok(())
    }

    /// Next chunk of the acquired image, at most `max_len` bytes.
    #[instrument(level = "trace", skip(self))]
    pub fn read(&mut self, max_len: usize) -> Result<ReadStatus, SessionError> {
        if !self.ctx.scanning {
            if std::mem::take(&mut self.cancelled) {
                return Ok(ReadStatus::Cancelled);
            }
            return Err(SessionError::NotScanning);
        }
        if self.ctx.cancel_requested() {
            self.on_cancel();
            self.cancelled = false;
            return Ok(ReadStatus::Cancelled);
        }

        let Some(buffer) = self.buffer.as_mut() else {
            return Err(SessionError::NotScanning);
        };
        let expected = buffer.image_size_bytes();
        if buffer.bytes_read() >= expected {
            self.buffer = None;
            self.ctx.scanning = false;
            self.goto_state(ScanState::Idle);
            self.observer.on_event(&ScanEvent::Complete);
            return Ok(ReadStatus::EndOfData);
        }
        let data = buffer.get(max_len);
        // Nothing unread, or the next row lacks a colour plane.
        if data.is_empty() && (max_len > 0 || buffer.bytes_unread() == 0) {
            error!(
                read = buffer.bytes_read(),
                expected, "No more data, but image incomplete"
            );
            return Err(SessionError::Incomplete {
                read: buffer.bytes_read(),
                expected,
            });
        }
        let current = buffer.bytes_read() as u64;
        self.observer.on_event(&ScanEvent::Progress {
            operation: Operation::Delivery,
            current,
            total: expected as u64,
        });
        Ok(ReadStatus::Data(data))
    }

    /// Request cancellation of the running scan. It takes effect at the
    /// next wait, line batch or `read`.
    pub fn cancel(&self) {
        if self.ctx.scanning {
            info!("Cancel requested");
            self.ctx.cancel.cancel();
        }
    }

    /// Stop the device, park the head and drop the image.
    fn on_cancel(&mut self) {
        info!("Cancelling scan");
        if let Err(outcome) = self.engine.stop_scan() {
            warn!(outcome = %outcome, "Stop scan failed");
        }
        if let Err(outcome) = self.engine.set_scan_head(1, 0) {
            warn!(outcome = %outcome, "Parking the scan head failed");
        }
        self.buffer = None;
        self.cancelled = true;
        self.goto_state(ScanState::Cancelled);
        self.observer.on_event(&ScanEvent::Cancelled);
        self.ctx.scanning = false;
        self.ctx.cancel.reset();
        self.goto_state(ScanState::Idle);
    }

    /// Leave a failed scan: stop the device if it was started.
    fn abort(&mut self) {
        if self.ctx.scanning {
            if let Err(outcome) = self.engine.stop_scan() {
                warn!(outcome = %outcome, "Stop scan failed");
            }
        }
        self.buffer = None;
        self.ctx.scanning = false;
        self.goto_state(ScanState::Idle);
    }

    /// Cancel a running scan and resynchronise the bridge.
    pub fn close(mut self) {
        info!("Closing scanner");
        if self.ctx.scanning {
            self.on_cancel();
        }
        if let Err(e) = self.engine.reset() {
            warn!(error = %e, "Bridge reset on close failed");
        }
    }

    pub fn read_state(&self) -> Result<ScannerState, SessionError> {
        self.engine.read_state().map_err(device("read state"))
    }

    pub fn get_mode(&self) -> Result<Mode, SessionError> {
        self.engine.get_mode().map_err(device("get mode"))
    }

    pub fn get_scan_frame(&self, index: u8) -> Result<ScanFrame, SessionError> {
        self.engine
            .get_scan_frame(index)
            .map_err(device("get scan frame"))
    }

    pub fn get_halftone_pattern(&self, index: u8) -> Result<HalftonePattern, SessionError> {
        self.engine
            .get_halftone_pattern(index)
            .map_err(device("get halftone pattern"))
    }

    pub fn set_scan_head(&self, mode: u8, steps: u16) -> Result<(), SessionError> {
        self.ensure_idle("set scan head")?;
        self.engine
            .set_scan_head(mode, steps)
            .map_err(device("set scan head"))
    }

    /// Slide transport and lamp control, e.g. [`SLIDE_NEXT`].
    pub fn slide(&self, action: u8) -> Result<(), SessionError> {
        self.ensure_idle("slide")?;
        self.engine.slide(action).map_err(device("slide"))
    }
}

/// Two step INQUIRY: the header tells the full length. An I/O error on the
/// first attempt resets the bridge once.
fn inquire<T: UsbTransport>(engine: &CommandEngine<T>) -> Result<ScannerProperties, SessionError> {
    let header = match engine.inquiry(INQUIRY_HEADER_LEN) {
        Err(CommandOutcome::IoError) => {
            warn!("Inquiry failed, resetting bridge");
            engine.reset()?;
            engine.inquiry(INQUIRY_HEADER_LEN)
        }
        other => other,
    }
    .map_err(device("inquiry"))?;
    let full = header.additional_length.saturating_add(4);
    engine.inquiry(full).map_err(device("inquiry"))
}

/// Whether a supported-device entry accepts the INQUIRY model.
pub fn model_supported(
    devices: &[SupportedDevice],
    vendor_id: u16,
    product_id: u16,
    model: u16,
) -> bool {
    devices.iter().any(|d| d.matches(vendor_id, product_id, model))
}
