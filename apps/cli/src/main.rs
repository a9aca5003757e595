use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use pieusb_core::{
    FrameFormat, ImageParameters, OptionId, ReadStatus, ScanConfig, ScanSession, StartStatus,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "PIE/Reflecta USB film scanner tool (Pure Rust)", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Identify the attached scanner
    Info,
    /// List the scan options and their current values
    Options {
        /// Option assignment, e.g. `resolution=1800` (repeatable)
        #[arg(short, long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,
    },
    /// Write the default configuration to a file
    InitConfig {
        /// Destination path
        path: PathBuf,
    },
    /// Acquire one image
    Scan {
        /// Option assignment, e.g. `mode=rgbi` (repeatable)
        #[arg(short, long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Pnm)]
        format: OutputFormat,

        /// Bytes requested per read
        #[arg(long, default_value_t = 64 * 1024)]
        chunk: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Interleaved samples as delivered, 16-bit little endian
    Raw,
    /// PBM/PGM/PPM with a header, 16-bit big endian
    Pnm,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ScanConfig> {
    match path {
        Some(path) => ScanConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(ScanConfig::default()),
    }
}

fn run(args: Args) -> Result<()> {
    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::InitConfig { path } => {
            config.save_to_file(&path)?;
            info!(path = %path.display(), "Configuration written");
        }
        Command::Info => {
            let session = ScanSession::open_usb(&config)?;
            let device = session.device();
            println!("Vendor:       {}", device.vendor);
            println!("Product:      {}", device.product);
            println!("Revision:     {}", device.revision);
            println!("USB id:       {:04X}:{:04X}", device.vendor_id, device.product_id);
            println!("Model:        0x{:02X}", device.model);
            println!("Firmware:     {}", device.firmware_version);
            println!("Resolution:   {} dpi", device.maximum_resolution);
            println!("Preview:      {} dpi", device.fast_preview_resolution);
            println!(
                "Scan bed:     {:.1} x {:.1} mm",
                device.bed_width_mm(),
                device.bed_height_mm()
            );
            println!(
                "Exposure:     {}..{}",
                device.minimum_exposure, device.maximum_exposure
            );
            match session.read_state() {
                Ok(state) => {
                    println!("Button:       {}", state.button_pushed);
                    println!("Warming up:   {}", state.warming_up);
                    println!("Scanning:     {}", state.scanning);
                }
                Err(e) => warn!(error = %e, "Reading scanner state failed"),
            }
            session.close();
        }
        Command::Options { set } => {
            let mut options = config.options();
            for assignment in &set {
                options.set_from_str(assignment)?;
            }
            for id in OptionId::ALL {
                println!("{:<18} {}", id.name(), options.get(id));
            }
        }
        Command::Scan {
            set,
            output,
            format,
            chunk,
        } => scan(&config, &set, &output, format, chunk)?,
    }
    Ok(())
}

fn scan(
    config: &ScanConfig,
    set: &[String],
    output: &Path,
    format: OutputFormat,
    chunk: usize,
) -> Result<()> {
    let mut session = ScanSession::open_usb(config)?;
    for assignment in set {
        let id = session.set_option_str(assignment)?;
        info!(option = %id, value = %session.get_option(id), "Option set");
    }

    info!("Starting scan");
    let params = match session.start()? {
        StartStatus::Ready(params) => params,
        StartStatus::Cancelled => {
            warn!("Scan cancelled");
            session.close();
            return Ok(());
        }
    };
    info!(
        width = params.pixels_per_line,
        lines = params.lines,
        depth = params.depth,
        colors = params.colors(),
        "Image ready"
    );

    let mut image = Vec::with_capacity(params.bytes_per_line * params.lines);
    loop {
        match session.read(chunk)? {
            ReadStatus::Data(data) => image.extend_from_slice(&data),
            ReadStatus::EndOfData => break,
            ReadStatus::Cancelled => {
                warn!("Scan cancelled during delivery");
                session.close();
                return Ok(());
            }
        }
    }
    if let Some(edges) = session.crop_suggestion() {
        info!(?edges, "Suggested crop");
    }
    session.close();

    let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let mut out = BufWriter::new(file);
    match format {
        OutputFormat::Raw => out.write_all(&image)?,
        OutputFormat::Pnm => write_pnm(&mut out, &params, &mut image)?,
    }
    out.flush()?;
    info!(path = %output.display(), bytes = image.len(), "Image written");
    Ok(())
}

/// Write a PBM, PGM or PPM file. Sixteen bit samples are swapped to the
/// big-endian order PNM requires.
fn write_pnm<W: Write>(out: &mut W, params: &ImageParameters, image: &mut [u8]) -> Result<()> {
    let width = params.pixels_per_line;
    let (magic, line_bytes) = match (params.format, params.depth) {
        (FrameFormat::Gray, 1) => ("P4", width.div_ceil(8)),
        (FrameFormat::Gray, 8) => ("P5", width),
        (FrameFormat::Gray, 16) => ("P5", 2 * width),
        (FrameFormat::Rgb, 8) => ("P6", 3 * width),
        (FrameFormat::Rgb, 16) => ("P6", 6 * width),
        (format, depth) => bail!("No PNM representation for {format:?} at {depth} bits, use --format raw"),
    };
    if line_bytes == 0 {
        bail!("Empty image");
    }
    let lines = image.len() / line_bytes;
    if params.depth == 16 {
        for pair in image.chunks_exact_mut(2) {
            pair.swap(0, 1);
        }
    }
    write!(out, "{magic}\n{width} {lines}\n")?;
    if magic != "P4" {
        let max = if params.depth == 16 { 65535 } else { 255 };
        writeln!(out, "{max}")?;
    }
    out.write_all(&image[..lines * line_bytes])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(format: FrameFormat, depth: u8, width: usize) -> ImageParameters {
        ImageParameters {
            format,
            depth,
            pixels_per_line: width,
            lines: 2,
            bytes_per_line: 0,
            last_frame: true,
        }
    }

    #[test]
    fn test_ppm_header() {
        let mut image = vec![1u8; 2 * 3 * 2];
        let mut out = Vec::new();
        write_pnm(&mut out, &params(FrameFormat::Rgb, 8, 2), &mut image).unwrap();
        assert!(out.starts_with(b"P6\n2 2\n255\n"));
        assert_eq!(out.len(), 11 + 12);
    }

    #[test]
    fn test_pgm16_is_big_endian() {
        let mut image = vec![0x34, 0x12];
        let mut out = Vec::new();
        write_pnm(&mut out, &params(FrameFormat::Gray, 16, 1), &mut image).unwrap();
        assert!(out.ends_with(&[0x12, 0x34]));
        assert!(out.starts_with(b"P5\n1 1\n65535\n"));
    }

    #[test]
    fn test_rgbi_needs_raw() {
        let mut image = vec![0u8; 8];
        let mut out = Vec::new();
        assert!(write_pnm(&mut out, &params(FrameFormat::Rgbi, 8, 2), &mut image).is_err());
    }
}
