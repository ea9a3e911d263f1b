//! Block processing loop
//!
//! Reads interleaved `f32` frames
//!
//! ```txt
//! [ x.re | x.im | y.re | y.im ]
//! ```
//!
//! in blocks, runs each block through the receiver, and writes
//! the recovered symbols. Receiver state carries over from one
//! block to the next. At the end of the input, the receiver is
//! flushed to obtain the last few symbols.

use std::io::{self, Read, Write};

use anyhow::Context;
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};

use fiberdsp::{
    CarrierBuilder, Compensation, DspError, EqualizerBuilder, FiberLink, KalmanNoise,
    PhaseDetector, Receiver, ReceiverBuilder, Sample, StepPolicy, TrackingFilter, UpdateForm,
    Waveform, POLARIZATIONS,
};

use crate::cli::{Args, CompensationKind, DetectorKind, OutputFormat, UpdateKind};

/// Totals for one run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Input frames consumed
    pub samples: u64,

    /// Symbols written
    pub symbols: u64,

    /// Blocks processed
    pub blocks: u64,
}

/// Configure the receiver from command-line `args`
pub fn build_receiver(args: &Args) -> Result<Receiver, DspError> {
    let mut link = FiberLink::new(args.span_length, args.spans);
    link.with_dispersion(args.dispersion)
        .with_wavelength(args.wavelength)
        .with_nonlinearity(args.gamma)
        .with_attenuation(args.attenuation);

    let compensation = match args.compensation {
        CompensationKind::None => Compensation::None,
        CompensationKind::Cdc => Compensation::Dispersion,
        CompensationKind::Dbp => Compensation::BackPropagation {
            steps: StepPolicy::PerSpan(args.dbp_steps),
            order: args.dbp_order,
        },
    };

    let update = match args.update {
        UpdateKind::Gradient => UpdateForm::Gradient,
        UpdateKind::Normalized => UpdateForm::Normalized {
            regularization: args.nlms_regularization,
        },
        UpdateKind::Sign => UpdateForm::Sign,
    };

    let mut equalizer = EqualizerBuilder::new();
    equalizer
        .with_taps(args.taps as usize)
        .with_step_size(args.mu)
        .with_update(update)
        .with_rule(args.rule);

    let order = args.modulation.phase_order();
    let detector = match args.carrier {
        DetectorKind::None => None,
        DetectorKind::Dd | DetectorKind::Kalman => Some(PhaseDetector::DecisionDirected),
        DetectorKind::Blind => Some(PhaseDetector::Blind { order }),
        DetectorKind::Hybrid => Some(PhaseDetector::Hybrid {
            order,
            blind_symbols: args.blind_symbols,
        }),
    };
    let tracking = match args.carrier {
        DetectorKind::Kalman => TrackingFilter::Kalman(KalmanNoise::default()),
        _ => TrackingFilter::Loop,
    };
    let carrier = detector.map(|detector| {
        let mut carrier = CarrierBuilder::new();
        carrier
            .with_loop_bandwidth(args.loop_bw)
            .with_detector(detector)
            .with_tracking(tracking);
        carrier
    });

    ReceiverBuilder::new(link)
        .with_compensation(compensation)
        .with_launch_power(args.launch_power)
        .with_nonlinear_scale(args.dbp_scale)
        .with_modulation(args.modulation)
        .with_equalizer(equalizer)
        .with_carrier(carrier)
        .with_frequency_estimate(args.frequency_estimate)
        .build()
}

/// Run the receiver over the whole `input`
///
/// Symbols are written to `output` in the format selected by
/// `args`, unless `args.quiet` is set.
pub fn run<R, W>(
    args: &Args,
    receiver: &Receiver,
    mut input: R,
    mut output: W,
) -> anyhow::Result<Summary>
where
    R: Read,
    W: Write,
{
    let mut summary = Summary::default();
    let mut state = receiver.initialize()?;
    let min_block = receiver.equalizer().num_taps();

    // read one block ahead so a short tail can join the block before it
    let mut ahead = read_frames(&mut input, args.block)?;
    while !ahead.is_empty() {
        let mut frames = std::mem::take(&mut ahead);
        if args.block > 0 && frames.len() == args.block {
            ahead = read_frames(&mut input, args.block)?;
        }
        if !ahead.is_empty() && ahead.len() < min_block {
            debug!("appending {} trailing samples to block {}", ahead.len(), summary.blocks);
            frames.append(&mut ahead);
        }
        if frames.len() < min_block {
            warn!(
                "dropping {} samples: too few for the equalizer",
                frames.len()
            );
            break;
        }

        let len = frames.len();
        let wf = Waveform::from_pairs(frames, args.rate, args.baud)?;
        let (out, next) = receiver
            .process(state, &wf, None)
            .with_context(|| format!("unable to process block {}", summary.blocks))?;
        state = next;

        debug!(
            "block {}: {} samples → {} symbols",
            summary.blocks,
            len,
            out.symbols.len()
        );
        summary.samples += len as u64;
        summary.blocks += 1;
        summary.symbols += write_symbols(args, &out.symbols, &mut output)?;
    }

    if summary.blocks > 0 {
        let (out, _state) = receiver.finish(state)?;
        summary.symbols += write_symbols(args, &out.symbols, &mut output)?;
    }
    output.flush()?;

    info!(
        "processed {} samples in {} blocks, recovered {} symbols",
        summary.samples, summary.blocks, summary.symbols
    );
    Ok(summary)
}

// Read up to `count` frames, or all remaining frames if `count` is zero
//
// A partial frame at the end of the input is discarded.
fn read_frames<R>(input: &mut R, count: usize) -> io::Result<Vec<[Sample; POLARIZATIONS]>>
where
    R: Read,
{
    let mut out = Vec::with_capacity(count);
    while count == 0 || out.len() < count {
        match read_frame(input) {
            Ok(Some(frame)) => out.push(frame),
            Ok(None) => break,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!("input ends with a partial sample frame");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

// Read one frame; `None` on a clean end of input
fn read_frame<R>(input: &mut R) -> io::Result<Option<[Sample; POLARIZATIONS]>>
where
    R: Read,
{
    let xr = match input.read_f32::<NativeEndian>() {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let xi = input.read_f32::<NativeEndian>()?;
    let yr = input.read_f32::<NativeEndian>()?;
    let yi = input.read_f32::<NativeEndian>()?;
    Ok(Some([
        Sample::new(xr as f64, xi as f64),
        Sample::new(yr as f64, yi as f64),
    ]))
}

// Write symbols in the selected format; returns the count written
fn write_symbols<W>(args: &Args, symbols: &Waveform, output: &mut W) -> io::Result<u64>
where
    W: Write,
{
    if args.quiet {
        return Ok(symbols.len() as u64);
    }

    for [x, y] in symbols.pairs() {
        match args.format {
            OutputFormat::Raw => {
                for v in [x.re, x.im, y.re, y.im] {
                    output.write_f32::<NativeEndian>(v as f32)?;
                }
            }
            OutputFormat::Text => {
                writeln!(output, "{:.6} {:.6} {:.6} {:.6}", x.re, x.im, y.re, y.im)?;
            }
        }
    }
    Ok(symbols.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use clap::Parser;
    use fiberdsp::simulate::{dual_pol_symbols, upsample};
    use fiberdsp::{Constellation, SpectralFilter, SplitStepPropagator};

    fn encode(wf: &Waveform) -> Vec<u8> {
        let mut out = Vec::new();
        for [x, y] in wf.pairs() {
            for v in [x.re, x.im, y.re, y.im] {
                out.write_f32::<NativeEndian>(v as f32).unwrap();
            }
        }
        out
    }

    // 20 km of linear fiber at two samples per symbol
    fn capture(symbols: usize) -> Vec<u8> {
        let mut link = FiberLink::new(20.0, 1);
        link.with_nonlinearity(0.0);
        let tx = dual_pol_symbols(&Constellation::qpsk(), symbols, 32.0e9, 5).unwrap();
        let up = upsample(&tx, 2, &SpectralFilter::new()).unwrap();
        let rx = SplitStepPropagator::new(link).propagate(&up).unwrap();
        encode(&rx)
    }

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "fiberdec",
            "--span-length",
            "20",
            "--gamma",
            "0",
            "--taps",
            "11",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("valid arguments")
    }

    #[test]
    fn test_read_frames() {
        let wf = Waveform::symbols(
            vec![Sample::new(1.0, -1.0), Sample::new(0.5, 0.25)],
            vec![Sample::new(-2.0, 3.0), Sample::new(0.0, 1.0)],
            1.0,
        )
        .unwrap();
        let mut bytes = encode(&wf);
        bytes.extend_from_slice(&[0u8; 6]);

        let mut cursor = Cursor::new(bytes);
        let first = read_frames(&mut cursor, 1).unwrap();
        assert_eq!(vec![[Sample::new(1.0, -1.0), Sample::new(-2.0, 3.0)]], first);
        let rest = read_frames(&mut cursor, 0).unwrap();
        assert_eq!(1, rest.len());
        assert_eq!(Sample::new(0.0, 1.0), rest[0][1]);
        assert!(read_frames(&mut cursor, 0).unwrap().is_empty());
    }

    #[test]
    fn test_build_receiver() {
        let rcv = build_receiver(&args(&[])).unwrap();
        assert_eq!(11, rcv.equalizer().num_taps());
        assert!(rcv.carrier().is_some());

        let rcv = build_receiver(&args(&[
            "-c",
            "dbp",
            "--launch-power",
            "2",
            "--modulation",
            "16qam",
            "--rule",
            "rde",
            "--update",
            "normalized",
            "--carrier",
            "hybrid",
        ]))
        .unwrap();
        assert_eq!(
            Some(PhaseDetector::Hybrid {
                order: 4,
                blind_symbols: 1000
            }),
            rcv.carrier().map(|c| c.detector())
        );

        let rcv = build_receiver(&args(&["--carrier", "kalman"])).unwrap();
        assert!(matches!(
            rcv.carrier().map(|c| c.tracking()),
            Some(TrackingFilter::Kalman(_))
        ));
        assert!(rcv.equalizer().decorrelation().is_some());

        let rcv = build_receiver(&args(&["--carrier", "none"])).unwrap();
        assert!(rcv.carrier().is_none());
    }

    #[test]
    fn test_run_text() {
        let args = args(&["--block", "0", "--format", "text"]);
        let rcv = build_receiver(&args).unwrap();

        let mut out = Vec::new();
        let summary = run(&args, &rcv, Cursor::new(capture(512)), &mut out).unwrap();
        assert_eq!(1024, summary.samples);
        assert_eq!(512, summary.symbols);
        assert_eq!(1, summary.blocks);

        let text = String::from_utf8(out).unwrap();
        assert_eq!(512, text.lines().count());
        assert!(text
            .lines()
            .all(|l| l.split_whitespace().count() == 4));
    }

    #[test]
    fn test_run_raw_blocks() {
        let args = args(&["--block", "400"]);
        let rcv = build_receiver(&args).unwrap();

        let mut out = Vec::new();
        let summary = run(&args, &rcv, Cursor::new(capture(600)), &mut out).unwrap();
        assert_eq!(1200, summary.samples);
        assert_eq!(3, summary.blocks);
        assert_eq!(600, summary.symbols);
        assert_eq!(600 * 16, out.len());
    }

    #[test]
    fn test_run_short_tail() {
        let args = args(&["--block", "400"]);
        let rcv = build_receiver(&args).unwrap();

        // 810 samples: the last 10 are fewer than the 11 taps
        let mut out = Vec::new();
        let summary = run(&args, &rcv, Cursor::new(capture(405)), &mut out).unwrap();
        assert_eq!(810, summary.samples);
        assert_eq!(2, summary.blocks);
        assert_eq!(405, summary.symbols);

        // too short for even one block
        let summary = run(&args, &rcv, Cursor::new(capture(5)), &mut out).unwrap();
        assert_eq!(0, summary.blocks);
        assert_eq!(0, summary.symbols);
    }

    #[test]
    fn test_run_quiet_and_empty() {
        let args = args(&["--quiet"]);
        let rcv = build_receiver(&args).unwrap();

        let mut out = Vec::new();
        let summary = run(&args, &rcv, Cursor::new(capture(256)), &mut out).unwrap();
        assert_eq!(256, summary.symbols);
        assert!(out.is_empty());

        let summary = run(&args, &rcv, Cursor::new(Vec::new()), &mut out).unwrap();
        assert_eq!(Summary::default(), summary);
    }
}
