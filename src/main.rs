//! The `quill` CLI: run a script, or inspect the pipeline's intermediate
//! output with `--dump-bytecode`.

use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;

use quill::common::source::Source;

/// A small dynamically-typed scripting language.
#[derive(Parser, Debug)]
#[command(name = "quill", version, about)]
struct Cli {
    /// Path to the script to run.
    script: String,

    /// Compile the script and print its disassembled bytecode instead of
    /// running it.
    #[arg(long)]
    dump_bytecode: bool,

    /// Collect garbage before every single allocation, to shake out
    /// reachability bugs that a lucky allocation pattern would hide.
    #[arg(long)]
    gc_stress: bool,

    /// Raise the log level to debug (pass twice for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    simple_logger::SimpleLogger::new().with_level(level).init().expect("logger installs exactly once");

    let source = match Source::path(&cli.script) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Error: could not read '{}': {}", cli.script, err);
            return ExitCode::FAILURE;
        }
    };

    if cli.dump_bytecode {
        return run_dump(source);
    }

    match quill::run_source(source, cli.gc_stress) {
        Ok(value) => {
            println!("{}", value);
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("{}", error);
            ExitCode::FAILURE
        }
    }
}

fn run_dump(source: std::rc::Rc<Source>) -> ExitCode {
    match quill::compile_source(source) {
        Ok((_heap, compiled)) => {
            let top = compiled.function.as_function().expect("compile() returns a Function object");
            print!("{}", top.chunk.disassemble("<script>"));
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("{}", error);
            ExitCode::FAILURE
        }
    }
}
