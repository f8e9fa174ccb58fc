use std::{
    fs::File,
    io::{self, Write},
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use anyhow::{anyhow, ensure, Context};
use clap::{App, Arg};
use log::warn;

use m2mdec::{
    decoder::{Codec, StreamInfo},
    device::namespace::SysfsNamespace,
    pipeline::{DecodeError, DecodeStatus, Picture, Pipeline, PipelineOptions},
};

const H264_START_CODE: [u8; 4] = [0x0, 0x0, 0x0, 0x1];
/// Empty calls made after the last access unit to flush pictures still in flight.
const DRAIN_CALLS: usize = 8;
/// Attempts at freeing an input buffer before giving up on an access unit.
const MAX_RETRIES: usize = 16;

fn nal_type(nal: &[u8]) -> u8 {
    nal.get(H264_START_CODE.len()).map_or(0, |b| b & 0x1f)
}

/// Splits an Annex B stream at its 4-byte start codes. Each NAL keeps its start code.
fn split_nals(stream: &[u8]) -> Vec<&[u8]> {
    let starts: Vec<usize> = stream
        .windows(H264_START_CODE.len())
        .enumerate()
        .filter(|(_, w)| *w == H264_START_CODE)
        .map(|(i, _)| i)
        .collect();

    starts
        .iter()
        .zip(starts.iter().skip(1).chain(std::iter::once(&stream.len())))
        .map(|(&start, &end)| &stream[start..end])
        .collect()
}

/// Groups NALs into access units, each one ending with a coded slice.
///
/// This is a pretty naive implementation that only handles streams with one slice per
/// picture.
fn access_units(nals: &[&[u8]]) -> Vec<Vec<u8>> {
    let mut units = Vec::new();
    let mut current = Vec::new();
    for nal in nals {
        current.extend_from_slice(nal);
        if matches!(nal_type(nal), 1 | 5) {
            units.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        units.push(current);
    }

    units
}

fn parse_size(size: &str) -> anyhow::Result<(u32, u32)> {
    let (width, height) = size
        .split_once('x')
        .ok_or_else(|| anyhow!("invalid size {:?}, expected WxH", size))?;
    Ok((width.parse()?, height.parse()?))
}

struct Output {
    file: Option<File>,
    start_time: std::time::Instant,
    frame_counter: usize,
}

impl Output {
    fn present(&mut self, picture: Option<Picture<'_>>) -> anyhow::Result<()> {
        let picture = match picture {
            Some(picture) => picture,
            None => return Ok(()),
        };

        self.frame_counter += 1;
        let elapsed = self.start_time.elapsed();
        let fps = self.frame_counter as f32 / elapsed.as_millis().max(1) as f32 * 1000.0;
        print!(
            "\rDecoded picture {:#5}, {}x{} {:?}, pts: {:?} fps: {:#5.2}",
            self.frame_counter, picture.width, picture.height, picture.format, picture.pts, fps,
        );
        io::stdout().flush()?;

        if let Some(ref mut file) = self.file {
            for plane in &picture.planes {
                file.write_all(plane.data)
                    .context("error while writing output data")?;
            }
        }

        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::builder().format_timestamp(None).init();

    let matches = App::new("V4L2 M2M decode pipeline")
        .arg(
            Arg::with_name("stream")
                .required(true)
                .help("Path to the H.264 Annex B stream to decode"),
        )
        .arg(
            Arg::with_name("display")
                .long("display")
                .takes_value(true)
                .help("Size of converted pictures, as WxH"),
        )
        .arg(
            Arg::with_name("output_file")
                .long("save")
                .takes_value(true)
                .help("Save the decoded frames to a file"),
        )
        .arg(
            Arg::with_name("force_converter")
                .long("force-converter")
                .help("Go through the converter even if the decoder can output NV12"),
        )
        .get_matches();

    let stream_path = matches
        .value_of("stream")
        .ok_or_else(|| anyhow!("stream argument not specified"))?;
    let stream = std::fs::read(stream_path)
        .with_context(|| format!("failed to read {}", stream_path))?;

    let mut options = PipelineOptions::new();
    if let Some(size) = matches.value_of("display") {
        let (width, height) = parse_size(size)?;
        options = options.display_size(width, height);
    }
    if matches.is_present("force_converter") {
        options = options.force_converter();
    }

    let output_file = matches
        .value_of("output_file")
        .map(File::create)
        .transpose()
        .context("invalid output file specified")?;

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .context("failed to set Ctrl-C handler")?;
    }

    let nals = split_nals(&stream);
    ensure!(!nals.is_empty(), "no H.264 stream detected in {}", stream_path);
    // Parameter sets before the first slice configure the decoder.
    let header_len = nals
        .iter()
        .take_while(|nal| matches!(nal_type(nal), 7 | 8))
        .count();
    let extradata: Vec<u8> = nals[..header_len].concat();
    let units = access_units(&nals[header_len..]);

    let info = StreamInfo::new(Codec::H264).with_extradata(extradata);
    let mut pipeline = Pipeline::new(options);
    pipeline
        .open(&SysfsNamespace::default(), &info)
        .context("failed to open decode pipeline")?;
    println!("Decoding {} access units with {}", units.len(), pipeline.name());

    let mut output = Output {
        file: output_file,
        start_time: std::time::Instant::now(),
        frame_counter: 0,
    };
    // Empty access units at the end drain pictures still in flight.
    let drain = std::iter::repeat(Vec::new()).take(DRAIN_CALLS);
    for (ts, unit) in units.into_iter().chain(drain).enumerate() {
        // Ctrl-c ?
        if lets_quit.load(Ordering::SeqCst) {
            break;
        }

        let ts = ts as i64;
        let mut retries = 0;
        loop {
            match pipeline.decode(&unit, ts, ts) {
                Ok(status) => {
                    if status == DecodeStatus::PictureReady {
                        output.present(pipeline.picture())?;
                    }
                    break;
                }
                // Pull a picture out so the hardware can release an input buffer, then
                // submit the same unit again.
                Err(DecodeError::InputBuffersExhausted) if retries < MAX_RETRIES => {
                    retries += 1;
                    if pipeline.decode(&[], ts, ts)? == DecodeStatus::PictureReady {
                        output.present(pipeline.picture())?;
                    }
                }
                Err(e) if !e.is_fatal() => {
                    warn!("Skipping access unit {}: {}", ts, e);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pipeline.dispose();
    println!();

    Ok(())
}
