use std::fmt::Display;

use clap::{error::ErrorKind, value_parser, CommandFactory, Parser, ValueEnum};

use fiberdsp::{Modulation, RuleKind, StepOrder};

/// Standard input filename
const STDIN_FILE: &str = "-";

const USAGE_SHORT: &str = r#"
This program accepts dual-polarization complex samples as native-endian 32-bit floats (f32), interleaved as [x.re, x.im, y.re, y.im], at the given sampling --rate. It compensates the fiber, equalizes, recovers the carrier, and writes the recovered symbols to standard output.

See --help for more details.
"#;

const USAGE_LONG: &str = r#"
This program accepts dual-polarization complex samples as native-endian 32-bit floats (f32), interleaved as [x.re, x.im, y.re, y.im], at the given sampling --rate. It compensates the fiber, equalizes, recovers the carrier, and writes the recovered symbols to standard output.

The sampling --rate must be an integer multiple of the --baud rate. Two samples per symbol is typical:

    fiberdec --rate 64e9 --baud 32e9 \
        --span-length 80 --spans 10 \
        --file capture.f32 > symbols.f32

Output symbols are written in the same interleaved f32 format, one frame per symbol. Use --format text for one line per symbol:

    x.re x.im y.re y.im

Fiber impairments are compensated by linear dispersion compensation (--compensation cdc) or by digital back-propagation (--compensation dbp). Back-propagation requires the per-channel --launch-power.

Samples are processed in blocks of --block samples. Dispersion is compensated over each block as a whole, so blocks should be much longer than the dispersive memory of the link. The adaptive equalizer and carrier tracker run continuously across blocks.
"#;

const ADVANCED: &str = "Advanced Receiver Options";

/// Output formats
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Interleaved native-endian f32
    Raw,

    /// One whitespace-separated line per symbol
    Text,
}

/// Impairment compensation
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompensationKind {
    /// None
    None,

    /// Chromatic dispersion compensation
    Cdc,

    /// Digital back-propagation
    Dbp,
}

/// Equalizer tap update
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateKind {
    /// Plain stochastic gradient
    Gradient,

    /// Normalized by input power (NLMS)
    Normalized,

    /// Sign of the error
    Sign,
}

/// Carrier phase detector
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorKind {
    /// No carrier recovery
    None,

    /// Decision-directed
    Dd,

    /// Blind M-th power
    Blind,

    /// Blind, then decision-directed
    Hybrid,

    /// Decision-directed extended Kalman filter
    Kalman,
}

/// Top-level program arguments
#[derive(Parser, Clone, Debug)]
#[command(version)]
#[command(about, long_about = None)]
#[command(after_help = USAGE_SHORT, after_long_help = USAGE_LONG)]
#[command(max_term_width = 100)]
pub struct Args {
    /// Verbosity level (-vvv for more)
    #[arg(short, long, default_value_t = 0, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print NOTHING, not even symbols
    #[arg(short, long)]
    pub quiet: bool,

    /// Sampling rate (Hz)
    #[arg(short, long, default_value_t = 64.0e9)]
    pub rate: f64,

    /// Symbol rate (Hz)
    #[arg(short, long, default_value_t = 32.0e9)]
    pub baud: f64,

    /// Input file (or "-" for stdin)
    ///
    /// The input must be interleaved [x.re, x.im, y.re, y.im]
    /// native-endian f32 at --rate.
    #[arg(long, default_value_t = STDIN_FILE.to_string())]
    pub file: String,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Raw)]
    pub format: OutputFormat,

    /// Modulation format (bpsk, qpsk, 8psk, 16qam)
    #[arg(short, long, default_value = "qpsk")]
    pub modulation: Modulation,

    /// Span length (km)
    #[arg(long, default_value_t = 80.0)]
    pub span_length: f64,

    /// Number of spans
    #[arg(long, default_value_t = 1)]
    pub spans: u32,

    /// Impairment compensation
    #[arg(short, long, value_enum, default_value_t = CompensationKind::Cdc)]
    pub compensation: CompensationKind,

    /// Launch power per channel (dBm), for back-propagation
    #[arg(long)]
    pub launch_power: Option<f64>,

    /// Samples per processing block (0 for the whole input)
    #[arg(long, default_value_t = 65536)]
    pub block: usize,

    /// Fiber dispersion (ps/nm/km)
    #[arg(long, default_value_t = 17.0)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub dispersion: f64,

    /// Carrier wavelength (nm)
    #[arg(long, default_value_t = 1550.0)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub wavelength: f64,

    /// Fiber nonlinearity γ (1/W/km)
    #[arg(long, default_value_t = 1.3)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub gamma: f64,

    /// Fiber attenuation (dB/km)
    #[arg(long, default_value_t = 0.2)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub attenuation: f64,

    /// Back-propagation steps per span
    #[arg(long, default_value_t = 2)]
    #[arg(value_parser = value_parser!(u32).range(1..))]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub dbp_steps: u32,

    /// Back-propagation step order
    #[arg(long, default_value = "symmetric")]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub dbp_order: StepOrder,

    /// Back-propagation nonlinear scale ξ (0.0 ≤ ξ ≤ 2.0)
    #[arg(long, default_value_t = 1.0)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub dbp_scale: f64,

    /// Equalizer taps per filter
    #[arg(long, default_value_t = 15)]
    #[arg(value_parser = value_parser!(u64).range(1..))]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub taps: u64,

    /// Equalizer adaptation rule (mucma, cma, rde, dd)
    #[arg(long, default_value = "mucma")]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub rule: RuleKind,

    /// Equalizer tap update
    #[arg(long, value_enum, default_value_t = UpdateKind::Gradient)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub update: UpdateKind,

    /// Equalizer step size μ
    #[arg(long, default_value_t = 1.0e-3)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub mu: f64,

    /// Regularization for --update normalized
    #[arg(long, default_value_t = 1.0e-3)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub nlms_regularization: f64,

    /// Carrier phase detector
    #[arg(long, value_enum, default_value_t = DetectorKind::Dd)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub carrier: DetectorKind,

    /// Carrier loop bandwidth (rad/symbol)
    #[arg(long, default_value_t = 0.01)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub loop_bw: f64,

    /// Symbols of blind tracking for --carrier hybrid
    #[arg(long, default_value_t = 1000)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub blind_symbols: u64,

    /// Seed the carrier tracker with a blind frequency estimate
    #[arg(long)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub frequency_estimate: bool,
}

impl Args {
    /// Return true if the user requests input from stdin
    pub fn input_is_stdin(&self) -> bool {
        self.file == STDIN_FILE
    }
}

/// A program-level error with exit code
#[derive(Debug)]
pub struct CliError {
    error: anyhow::Error,
    exit_code: i32,
}

impl CliError {
    /// Create new error with a custom exit code
    pub fn new(error: anyhow::Error, code: i32) -> CliError {
        CliError {
            error,
            exit_code: code,
        }
    }

    /// Print this error to the terminal
    ///
    /// Errors from clap are printed verbatim. Other types of errors
    /// are printed indirectly via clap's fancy formatter.
    pub fn print(&self) -> std::io::Result<()> {
        if let Some(e) = self.error.downcast_ref::<clap::Error>() {
            e.print()
        } else {
            Args::command()
                .error(ErrorKind::Format, self.to_string())
                .print()
        }
    }

    /// Print this error to the terminal and exit
    pub fn exit(&self) -> ! {
        drop(self.print());
        std::process::exit(self.exit_code);
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.error)
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> CliError {
        CliError::new(err, 1)
    }
}

impl From<clap::Error> for CliError {
    fn from(err: clap::Error) -> CliError {
        let code = if err.use_stderr() { 1 } else { 0 };
        CliError::new(err.into(), code)
    }
}
