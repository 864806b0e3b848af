use clap::Parser;
use log::LevelFilter;

use parz::cli::Cli;
use parz::engine;
use parz::options::{Mode, Options};

fn main() {
    // clap itself exits with 2 on malformed arguments.
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(if cli.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .format_timestamp(None)
        .init();

    let (opts, file, target) = match cli.into_options() {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("parz: {}", e);
            std::process::exit(2);
        }
    };

    match run(&opts, file.as_deref(), target.as_deref()) {
        Ok(()) => {}
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    }
}

fn run(
    opts: &Options,
    file: Option<&std::path::Path>,
    target: Option<&std::path::Path>,
) -> Result<(), engine::EngineError> {
    let stats = match (&opts.mode, opts.pipe_mode) {
        (Mode::Compress(_), true) => engine::compress_pipe(opts)?,
        (Mode::Compress(_), false) => {
            engine::compress_file(opts, file.expect("validated: file present"), target)?
        }
        (Mode::Decompress, true) => engine::decompress_pipe(opts)?,
        (Mode::Decompress, false) => {
            engine::decompress_file(opts, file.expect("validated: file present"), target)?
        }
    };

    if opts.cmp_stats {
        stats.print(opts.mode == Mode::Decompress);
    }
    Ok(())
}
