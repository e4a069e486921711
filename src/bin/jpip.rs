//! jpip CLI - inspect and reassemble captured JPIP responses.
//!
//! Operates on raw jpp-stream response bodies saved to disk (for
//! example with `curl --output` against a JPIP server): `dump` lists
//! the databin messages a capture carries, `reconstruct` turns one or
//! more captures into a decodable .j2c codestream.

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;

use jpip_rs::codestream::{CodestreamStructure, ProgressionOrder};
use jpip_rs::databin::{DatabinClass, DatabinsSaver, ObjectPoolByDatabin};
use jpip_rs::protocol::{EndOfResponse, MessageHeaderParser, ParsedItem};
use jpip_rs::writers::{ReconstructionParams, Reconstructor};

/// JPIP response inspection and codestream reassembly
#[derive(Parser)]
#[command(name = "jpip")]
#[command(author = "jpip-rs contributors")]
#[command(version)]
#[command(about = "Inspect captured JPIP responses and rebuild JPEG 2000 codestreams", long_about = None)]
#[command(after_help = "EXAMPLES:
    jpip dump -i response.jpp
    jpip dump -i response.jpp --verbose
    jpip reconstruct -i response.jpp -o image.j2c
    jpip reconstruct -i header.jpp -i body.jpp -o thumb.j2c -r 2

INPUT FORMAT:
    Raw jpp-stream response bodies (image/jpp-stream), as returned by a
    JPIP server for type=jpp-stream requests.

For more information, visit: https://github.com/rad-medica/jpip-rs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the databin messages carried by a captured response
    ///
    /// Parses the message stream, accumulates the databins, and prints
    /// an inventory plus codestream geometry once the main header is
    /// complete.
    #[command(visible_alias = "d")]
    Dump {
        /// Captured jpp-stream response body (repeatable, applied in order)
        #[arg(short, long, required = true)]
        input: Vec<PathBuf>,

        /// Print every message header, not just the summary
        #[arg(short, long)]
        verbose: bool,
    },

    /// Rebuild a decodable .j2c codestream from captured responses
    ///
    /// Databins from all inputs are merged; precinct data missing from
    /// the captures is emitted as empty packets, so partial captures
    /// still yield a valid (lower quality) codestream.
    #[command(visible_alias = "r")]
    Reconstruct {
        /// Captured jpp-stream response body (repeatable, applied in order)
        #[arg(short, long, required = true)]
        input: Vec<PathBuf>,

        /// Output codestream path
        #[arg(short, long)]
        output: PathBuf,

        /// Resolution levels to drop from the output
        #[arg(short = 'r', long, default_value = "0")]
        reduction: u8,

        /// Cap on quality layers whose data is included
        #[arg(short = 'q', long)]
        quality: Option<u32>,

        /// Override the codestream's progression order for packet layout
        #[arg(short = 'p', long, value_enum)]
        progression: Option<Progression>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Progression {
    Lrcp,
    Rlcp,
    Rpcl,
    Pcrl,
    Cprl,
}

impl From<Progression> for ProgressionOrder {
    fn from(value: Progression) -> Self {
        match value {
            Progression::Lrcp => ProgressionOrder::Lrcp,
            Progression::Rlcp => ProgressionOrder::Rlcp,
            Progression::Rpcl => ProgressionOrder::Rpcl,
            Progression::Pcrl => ProgressionOrder::Pcrl,
            Progression::Cprl => ProgressionOrder::Cprl,
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Dump { input, verbose } => dump(&input, verbose),
        Commands::Reconstruct {
            input,
            output,
            reduction,
            quality,
            progression,
        } => reconstruct(&input, &output, reduction, quality, progression),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

struct MessageSummary {
    class: DatabinClass,
    in_class_id: u64,
    body_offset: usize,
    body_length: usize,
    is_last: bool,
}

/// Feeds one captured response body into the saver, returning the
/// message summaries and the trailing EOR if present.
fn ingest(
    saver: &mut DatabinsSaver,
    body: &[u8],
) -> Result<(Vec<MessageSummary>, Option<EndOfResponse>), Box<dyn std::error::Error>> {
    let mut parser = MessageHeaderParser::new();
    let mut pos = 0;
    let mut messages = Vec::new();
    let mut eor = None;

    while let Some(item) = parser.parse(body, pos)? {
        match item {
            ParsedItem::Header { header, next_pos } => {
                let end = next_pos + header.body_length;
                if end > body.len() {
                    return Err("message body truncated".into());
                }
                saver.save_message(&header, &body[next_pos..end])?;
                messages.push(MessageSummary {
                    class: header.class,
                    in_class_id: header.in_class_id,
                    body_offset: header.body_offset,
                    body_length: header.body_length,
                    is_last: header.is_last_in_databin,
                });
                pos = end;
            }
            ParsedItem::EndOfResponse { eor: trailer, next_pos } => {
                eor = Some(trailer);
                pos = next_pos;
                break;
            }
        }
    }
    Ok((messages, eor))
}

fn dump(inputs: &[PathBuf], verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut saver = DatabinsSaver::new();
    let mut total_messages = 0usize;
    let mut total_bytes = 0usize;

    for path in inputs {
        let body = fs::read(path)?;
        println!("Capture: {:?} ({} bytes)", path, body.len());
        let (messages, eor) = ingest(&mut saver, &body)?;

        if verbose {
            for m in &messages {
                println!(
                    "  {:?} bin {} bytes {}..{}{}",
                    m.class,
                    m.in_class_id,
                    m.body_offset,
                    m.body_offset + m.body_length,
                    if m.is_last { " (final)" } else { "" }
                );
            }
        }
        println!("  Messages: {}", messages.len());
        if let Some(eor) = eor {
            println!("  End of response: {:?}", eor.code);
        }
        total_messages += messages.len();
        total_bytes += body.len();
        println!();
    }

    println!("Totals:");
    println!("  Captures:  {}", inputs.len());
    println!("  Messages:  {}", total_messages);
    println!("  Bytes:     {}", total_bytes);
    println!("  Precincts: {}", saver.loaded_precinct_count());

    let main_header = saver.main_header();
    let main_header = main_header.borrow();
    match CodestreamStructure::from_main_header(&main_header)? {
        Some(structure) => {
            println!();
            println!("Codestream:");
            println!("  Dimensions: {}x{}", structure.width, structure.height);
            println!("  Components: {}", structure.num_components());
            println!(
                "  Tiles:      {} ({}x{} grid)",
                structure.num_tiles(),
                structure.num_tiles_x(),
                structure.num_tiles_y()
            );
            println!("  DWT levels: {}", structure.max_decomposition_levels());
            println!("  Layers:     {}", structure.num_quality_layers);
            println!(
                "  Progression: {}",
                match structure.progression_order {
                    ProgressionOrder::Lrcp => "LRCP",
                    ProgressionOrder::Rlcp => "RLCP",
                    ProgressionOrder::Rpcl => "RPCL",
                    ProgressionOrder::Pcrl => "PCRL",
                    ProgressionOrder::Cprl => "CPRL",
                }
            );
        }
        None => {
            println!();
            println!("Codestream: main header incomplete");
        }
    }
    Ok(())
}

fn reconstruct(
    inputs: &[PathBuf],
    output: &PathBuf,
    reduction: u8,
    quality: Option<u32>,
    progression: Option<Progression>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut saver = DatabinsSaver::new();
    for path in inputs {
        let body = fs::read(path)?;
        ingest(&mut saver, &body)?;
    }

    let structure = {
        let main_header = saver.main_header();
        let main_header = main_header.borrow();
        CodestreamStructure::from_main_header(&main_header)?
            .ok_or("main header incomplete; capture more of the response")?
    };

    let params = ReconstructionParams {
        resolution_reduction: reduction,
        max_quality_layers: quality.unwrap_or(u32::MAX),
        progression_order: progression.map(ProgressionOrder::from),
    };
    let mut pool = ObjectPoolByDatabin::new();
    let bytes = Reconstructor::new(&structure, &mut pool)
        .reconstruct(&saver, params)?
        .ok_or("main header incomplete; capture more of the response")?;

    fs::write(output, &bytes)?;
    println!(
        "✓ Reconstructed {}x{} codestream ({} bytes) to {:?}",
        structure.width >> reduction,
        structure.height >> reduction,
        bytes.len(),
        output
    );
    Ok(())
}
