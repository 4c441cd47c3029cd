use clap::{Parser, Subcommand};
use log::LevelFilter;
use mwm::codec::CodecId;
use mwm::container::ContainerReader;
use mwm::header::{DataHeader, Rect};
use mwm::map_value::{pack_file, FileLoader, LoaderOptions, MapValue, PackOptions, DEFAULT_COMPRESSION_LEVEL};
use mwm::registry::Registry;
use mwm::version::{ContainerVersion, Format};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "mwm", about = "Offline map container tool")]
struct Cli {
    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack files into a container, one blob per input
    Pack {
        #[arg(short, long)]
        output: PathBuf,
        /// Codec: deflate (default), zstd, lz4, brotli, lzma, none
        #[arg(short, long, default_value = "deflate", value_parser = parse_codec)]
        codec: CodecId,
        #[arg(short, long, default_value_t = DEFAULT_COMPRESSION_LEVEL)]
        level: i32,
        /// log2 of the uncompressed chunk capacity
        #[arg(long, default_value_t = mwm::blob_storage::DEFAULT_BITS_IN_CHUNK_SIZE,
              value_parser = clap::value_parser!(u8).range(1..=31))]
        chunk_bits: u8,
        /// Coverage as min_x,min_y,max_x,max_y
        #[arg(long, default_value = "0,0,0,0", value_parser = parse_bounds)]
        bounds: Rect,
        /// Scale range as min,max
        #[arg(long, default_value = "0,17", value_parser = parse_scales)]
        scales: (u8, u8),
        /// Write a container without the version block
        #[arg(long)]
        legacy: bool,
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// Show container version, header and sections
    Info {
        input: PathBuf,
        #[arg(long)]
        json: bool,
        #[arg(short, long, default_value = "deflate", value_parser = parse_codec)]
        codec: CodecId,
    },
    /// Print one blob
    Blob {
        input: PathBuf,
        index: u32,
        /// Print as hex instead of raw bytes
        #[arg(long)]
        hex: bool,
        #[arg(short, long, default_value = "deflate", value_parser = parse_codec)]
        codec: CodecId,
    },
    /// Register every container in a directory and list the registry
    List {
        dir: PathBuf,
        #[arg(long)]
        json: bool,
        #[arg(short, long, default_value = "deflate", value_parser = parse_codec)]
        codec: CodecId,
    },
}

#[derive(Serialize)]
struct InfoReport<'a> {
    path:     String,
    version:  ContainerVersion,
    header:   DataHeader,
    sections: &'a [mwm::container::SectionEntry],
    blobs:    u32,
    chunks:   u32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        })
        .format_timestamp(None)
        .init();

    match cli.command {

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { output, codec, level, chunk_bits, bounds, scales, legacy, input } => {
            let header = DataHeader { bounds, min_scale: scales.0, max_scale: scales.1 };
            let opts = PackOptions {
                codec,
                level,
                bits_in_chunk_size: chunk_bits,
                version: legacy.then_some(ContainerVersion::LEGACY),
            };
            let mut blobs = Vec::with_capacity(input.len());
            for path in &input {
                blobs.push(std::fs::read(path)?);
                println!("  blob {:>4}  {}", blobs.len() - 1, path.display());
            }
            pack_file(&output, &header, &blobs, &opts)?;
            println!("Created: {}", output.display());
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json, codec } => {
            let map = open_map(&input, codec)?;
            let report = InfoReport {
                path:     input.display().to_string(),
                version:  map.version(),
                header:   *map.header(),
                sections: map.container().sections(),
                blobs:    map.blob_count(),
                chunks:   map.blobs().map_or(0, |b| b.chunk_count()),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_info(&report);
            }
        }

        // ── Blob ─────────────────────────────────────────────────────────────
        Commands::Blob { input, index, hex, codec } => {
            let map = open_map(&input, codec)?;
            let data = map
                .blob(index)
                .ok_or_else(|| format!("blob {index} out of range 0..{}", map.blob_count()))??;
            if hex {
                println!("{}", hex::encode(&data));
            } else {
                std::io::stdout().lock().write_all(&data)?;
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { dir, json, codec } => {
            let registry = Registry::new(FileLoader::new(LoaderOptions { data_dir: dir.clone(), codec }));
            let mut names: Vec<String> = std::fs::read_dir(&dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.ends_with(".mwm"))
                .collect();
            names.sort();
            for name in &names {
                if let Err(e) = registry.add(name) {
                    log::warn!("Skipping {name}: {e}");
                }
            }

            let snapshot = registry.info_snapshot();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("{:<8} {:<28} {:<8} {:>7} {:>7}  Bounds", "Slot", "Name", "Format", "Date", "Scales");
                for info in &snapshot {
                    println!(
                        "{:<8} {:<28} {:<8} {:>7} {:>7}  {}",
                        info.id.to_string(),
                        info.name,
                        format_name(info.version.format),
                        info.version.timestamp,
                        format!("{}-{}", info.min_scale, info.max_scale),
                        format_rect(&info.bounds),
                    );
                }
                println!("{} of {} containers registered", registry.active_count(), names.len());
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn open_map(path: &Path, codec: CodecId) -> Result<MapValue, Box<dyn std::error::Error>> {
    Ok(MapValue::open(ContainerReader::open_path(path)?, codec)?)
}

fn print_info(r: &InfoReport<'_>) {
    println!("── Map container ────────────────────────────────────────");
    println!("  Path           {}", r.path);
    println!("  Format         {}", format_name(r.version.format));
    match r.version.date() {
        Some(date) => println!("  Generated      {} ({})", r.version.timestamp, date),
        None       => println!("  Generated      {}", r.version.timestamp),
    }
    println!("  Bounds         {}", format_rect(&r.header.bounds));
    println!("  Scales         {}..={}", r.header.min_scale, r.header.max_scale);
    println!("  Blobs          {} in {} chunks", r.blobs, r.chunks);
    println!("  Sections ({}):", r.sections.len());
    for s in r.sections {
        println!("    {:<12} {:>10} B  @ {}", s.tag, s.len, s.offset);
    }
}

fn format_name(f: Format) -> &'static str {
    match f {
        Format::Legacy => "legacy",
        Format::V1     => "v1",
        Format::V2     => "v2",
        Format::V3     => "v3",
    }
}

fn format_rect(r: &Rect) -> String {
    format!("[{}, {}] - [{}, {}]", r.min_x, r.min_y, r.max_x, r.max_y)
}

fn parse_codec(s: &str) -> Result<CodecId, String> {
    CodecId::from_name(s).ok_or_else(|| format!("unknown codec '{s}'"))
}

fn parse_numbers<T: std::str::FromStr>(s: &str, n: usize) -> Result<Vec<T>, String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<T>().map_err(|_| format!("'{p}' is not a number")))
        .collect::<Result<Vec<T>, String>>()?;
    if parts.len() != n {
        return Err(format!("expected {n} comma-separated values, got {}", parts.len()));
    }
    Ok(parts)
}

fn parse_bounds(s: &str) -> Result<Rect, String> {
    let v = parse_numbers::<f64>(s, 4)?;
    let rect = Rect::new(v[0], v[1], v[2], v[3]);
    if !rect.is_valid() {
        return Err(format!("bounds '{s}' have min above max"));
    }
    Ok(rect)
}

fn parse_scales(s: &str) -> Result<(u8, u8), String> {
    let v = parse_numbers::<u8>(s, 2)?;
    if v[0] > v[1] {
        return Err(format!("scale range '{s}' is inverted"));
    }
    Ok((v[0], v[1]))
}
