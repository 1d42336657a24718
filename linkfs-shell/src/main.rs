use clap::{ArgAction, Parser};
use env_logger::Builder;
use log::LevelFilter;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

mod commands;

use commands::{Flow, Shell};

#[derive(Parser)]
#[command(name = "linkfs")]
#[command(version = "0.1.0")]
#[command(about = "Interactive shell over a single file filesystem image")]
struct Cli {
    /// Image to mount at startup.
    #[arg(value_name = "IMAGE_FILE")]
    image_file: Option<PathBuf>,
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    Builder::new()
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .filter(None, level)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if std::env::var("RUST_LOG").is_err() {
        init_logger(cli.verbose);
    } else {
        env_logger::init();
    }

    let mut shell = Shell::new();
    if let Some(image) = &cli.image_file {
        if let Err(e) = shell.mount(image) {
            eprintln!("{:#}", e);
        }
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut lines = stdin.lock().lines();
    loop {
        {
            let mut out = stdout.lock();
            write!(out, "\n> ")?;
            out.flush()?;
        }

        let line = match lines.next() {
            Some(line) => line?,
            None => break,
        };

        match shell.execute(&line, &mut stdout.lock()) {
            Ok(Flow::Exit) => break,
            Ok(Flow::Continue) => (),
            Err(e) => eprintln!("{:#}", e),
        }
    }

    // Leaving the loop releases a still mounted image through its handle.
    if shell.is_mounted() {
        shell.execute("umount", &mut io::sink())?;
    }
    Ok(())
}
