use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};

use clap::Parser;
use gopcast::{Pipeline, wire};

#[derive(Parser)]
#[command(
    name = "gopcast-pipe",
    about = "Demux a live fMP4 stream into self-delimiting frame messages"
)]
struct Args {
    /// Input fragmented-MP4 stream; "-" reads stdin
    #[arg(long, short, default_value = "-")]
    input: String,
}

fn main() {
    // Log to stderr: stdout carries the frame stream.
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let args = Args::parse();

    let reader: Box<dyn Read + Send> = if args.input == "-" {
        Box::new(io::stdin())
    } else {
        match File::open(&args.input) {
            Ok(file) => Box::new(BufReader::new(file)),
            Err(e) => {
                eprintln!("Failed to open {}: {}", args.input, e);
                std::process::exit(1);
            }
        }
    };

    let pipeline = Pipeline::spawn(reader);
    let pump_result = pump(&pipeline);
    let parse_result = pipeline.join();

    if let Err(e) = pump_result.and(parse_result) {
        eprintln!("Stream failed: {e}");
        std::process::exit(1);
    }
    tracing::info!("stream ended");
}

/// Forward the init segment and every frame to stdout, flushing per
/// message to keep end-to-end latency low.
fn pump(pipeline: &Pipeline) -> gopcast::Result<()> {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    if let Some(init) = pipeline.init().wait() {
        wire::encode_init(&mut out, &init)?;
        out.flush()?;
    }
    for frame in pipeline.frames().iter() {
        wire::encode_frame(&mut out, &frame)?;
        out.flush()?;
    }
    Ok(())
}
