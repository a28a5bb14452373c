//! A small, illustrative command-line front end for the `fleece` crate.
//! Not meant to be a complete tool, and not assumed to be the only
//! consumer of the library: it exists so the crate can be exercised
//! end-to-end from a shell.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use fleece::encoder::{Encoder, EncoderOptions};
use fleece::json_converter::JSONConverter;
use fleece::json_encoder::{JSONEncoder, JSONOptions};
use fleece::path::Path as FleecePath;
use fleece::value::Value;
use fleece::DeepIterator;

#[derive(Parser)]
#[command(name = "fleece", about = "Encode, inspect, and query Fleece documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read JSON and write its Fleece encoding.
    Encode {
        /// JSON input file; reads stdin if omitted.
        input: Option<PathBuf>,
        /// Fleece output file; writes stdout if omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Skip sorting dict keys (disables binary-search lookup).
        #[arg(long)]
        no_sort_keys: bool,
        /// Skip string deduplication.
        #[arg(long)]
        no_unique_strings: bool,
    },
    /// Read a Fleece document and print it as JSON.
    Dump {
        /// Fleece input file; reads stdin if omitted.
        input: Option<PathBuf>,
        /// Sort dict keys and use shortest round-trip number formatting.
        #[arg(long)]
        canonical: bool,
        /// Trust the input is well-formed; skip structural validation.
        #[arg(long)]
        trusted: bool,
    },
    /// Evaluate a path expression or JSON Pointer against a document.
    Get {
        /// Fleece input file.
        input: PathBuf,
        /// A dotted path ("foo.bar[0]") or, with --pointer, an RFC 6901
        /// JSON Pointer ("/foo/bar/0").
        path: String,
        /// Interpret `path` as a JSON Pointer instead of a dotted path.
        #[arg(long)]
        pointer: bool,
    },
    /// Depth-first walk of a document, printing each descendant's JSON
    /// Pointer and value.
    Walk {
        /// Fleece input file.
        input: PathBuf,
    },
}

fn read_input(input: Option<&PathBuf>) -> io::Result<Vec<u8>> {
    match input {
        Some(path) => fs::read(path),
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

fn write_output(output: Option<&PathBuf>, bytes: &[u8]) -> io::Result<()> {
    match output {
        Some(path) => fs::write(path, bytes),
        None => io::stdout().write_all(bytes),
    }
}

fn run() -> fleece_base::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Encode {
            input,
            output,
            no_sort_keys,
            no_unique_strings,
        } => {
            let text = read_input(input.as_ref())
                .map_err(|e| fleece_base::err(fleece_base::ErrorKind::JSONError, e.to_string()))?;
            let text = String::from_utf8(text)
                .map_err(|e| fleece_base::err(fleece_base::ErrorKind::JSONError, e.to_string()))?;
            let options = EncoderOptions {
                sort_keys: !no_sort_keys,
                unique_strings: !no_unique_strings,
                ..Default::default()
            };
            let buf = JSONConverter::encode_json_text(&text, options)?;
            write_output(output.as_ref(), &buf)
                .map_err(|e| fleece_base::err(fleece_base::ErrorKind::MemoryError, e.to_string()))?;
            Ok(())
        }
        Command::Dump {
            input,
            canonical,
            trusted,
        } => {
            let buf = read_input(input.as_ref())
                .map_err(|e| fleece_base::err(fleece_base::ErrorKind::InvalidData, e.to_string()))?;
            let root = if trusted {
                Value::from_trusted_data(&buf)
            } else {
                Value::from_data(&buf)?
            };
            let mut enc = JSONEncoder::new(JSONOptions {
                canonical,
                ..Default::default()
            });
            enc.write_value(&root, None);
            println!("{}", enc.finish_string()?);
            Ok(())
        }
        Command::Get { input, path, pointer } => {
            let buf = fs::read(&input)
                .map_err(|e| fleece_base::err(fleece_base::ErrorKind::InvalidData, e.to_string()))?;
            let root = Value::from_data(&buf)?;
            let found = if pointer {
                FleecePath::eval_json_pointer(&path, root, None)?
            } else {
                FleecePath::eval_str(&path, root, None)?
            };
            match found {
                Some(v) => println!("{}", v.to_json_string()),
                None => eprintln!("(not found)"),
            }
            Ok(())
        }
        Command::Walk { input } => {
            let buf = fs::read(&input)
                .map_err(|e| fleece_base::err(fleece_base::ErrorKind::InvalidData, e.to_string()))?;
            let root = Value::from_data(&buf)?;
            let mut it = DeepIterator::new(root, None);
            loop {
                it.next();
                let Some(v) = it.value() else { break };
                println!("{}\t{}", it.json_pointer(), v.to_json_string());
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
