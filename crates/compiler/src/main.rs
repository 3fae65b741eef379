//! chibicc CLI
//!
//! Reads one C source file (or standard input), compiles it and writes
//! x86-64 assembly to the output path (or standard output).

use clap::{CommandFactory, Parser as ClapParser};
use clap_complete::{Shell, generate};
use std::fs;
use std::io::{self, Read, Write};
use std::process;

#[derive(ClapParser)]
#[command(name = "chibicc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compile a C source file to x86-64 assembly", long_about = None)]
struct Cli {
    /// Input C source file ("-" reads standard input)
    #[arg(required_unless_present = "completions")]
    input: Option<String>,

    /// Output assembly path ("-" or omitted writes standard output)
    #[arg(short, long)]
    output: Option<String>,

    /// Generate a shell completion script and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    // Usage errors exit 1; --help and --version exit 0.
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let is_error = e.use_stderr();
        let _ = e.print();
        process::exit(if is_error { 1 } else { 0 });
    });

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "chibicc", &mut io::stdout());
        return;
    }

    let Some(input) = cli.input else {
        // Unreachable through clap, which requires the input otherwise.
        eprintln!("chibicc: no input file");
        process::exit(1);
    };

    let source = match read_source(&input) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("chibicc: cannot open {}: {}", input, e);
            process::exit(1);
        }
    };

    let asm = match chibicc::compile(&source, &input) {
        Ok(asm) => asm,
        Err(e) => {
            eprint!("{}", e.render(&input, &source));
            process::exit(1);
        }
    };

    if let Err(e) = write_output(cli.output.as_deref(), &asm) {
        eprintln!("chibicc: cannot write output: {}", e);
        process::exit(1);
    }
}

/// Read the source file, or stdin for "-". The scanner wants the buffer to
/// end in a newline, so one is appended if the file lacks it.
fn read_source(path: &str) -> io::Result<String> {
    let mut source = if path == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(path)?
    };

    if !source.ends_with('\n') {
        source.push('\n');
    }
    Ok(source)
}

fn write_output(path: Option<&str>, asm: &str) -> io::Result<()> {
    match path {
        None | Some("-") => io::stdout().write_all(asm.as_bytes()),
        Some(path) => fs::write(path, asm),
    }
}
