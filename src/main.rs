#![warn(clippy::all)]

mod assembler;
mod bytecode;
mod diagnostic;
mod repl;
mod scanner;
mod value;
mod vm;

use diagnostic::{ansi::AnsiRenderer, json, Diagnostic};
use vm::Vm;

/// How diagnostics reach stderr. Chosen by flag, or from the environment
/// when no flag is given.
#[derive(Clone, Copy)]
enum OutputMode {
    Ansi,
    Plain,
    Json,
}

impl OutputMode {
    fn from_flag(arg: &str) -> Option<OutputMode> {
        match arg {
            "--ansi" | "-a" => Some(OutputMode::Ansi),
            "--text" | "-t" => Some(OutputMode::Plain),
            "--json" | "-j" => Some(OutputMode::Json),
            _ => None,
        }
    }

    /// Default from where stderr is going: a pipe gets JSON, a terminal
    /// gets colour unless NO_COLOR asks for plain text.
    fn auto() -> OutputMode {
        // SAFETY: the isatty call only inspects fd 2 and touches no memory;
        // a closed or redirected stderr just makes it report "not a tty".
        let stderr_is_tty = unsafe { libc::isatty(libc::STDERR_FILENO) } != 0;
        if !stderr_is_tty {
            OutputMode::Json
        } else if std::env::var_os("NO_COLOR").is_some() {
            OutputMode::Plain
        } else {
            OutputMode::Ansi
        }
    }

    fn render(self, d: &Diagnostic) -> String {
        match self {
            OutputMode::Ansi => AnsiRenderer { use_color: true }.render(d),
            OutputMode::Plain => AnsiRenderer { use_color: false }.render(d),
            OutputMode::Json => format!("{}\n", json::render(d)),
        }
    }
}

fn report(d: &Diagnostic, mode: OutputMode) {
    eprint!("{}", mode.render(d));
}

fn usage(program: &str) {
    eprintln!("Usage: {program} -repl | -c [--tokens|--bytes] <file> [file...]");
    eprintln!("       {program} --version | -V");
    eprintln!();
    eprintln!("Output format (errors):");
    eprintln!("  --ansi / -a   Force ANSI colour output (default when stderr is a TTY)");
    eprintln!("  --text / -t   Force plain text output (no colour)");
    eprintln!("  --json / -j   Force JSON output (default when stderr is not a TTY)");
    eprintln!("  NO_COLOR=1    Disable colour (same as --text)");
    eprintln!();
    eprintln!("Dump modes (with -c):");
    eprintln!("  --tokens      Print the scanned token stream as JSON and stop");
    eprintln!("  --bytes       Print the assembled instruction listing and stop");
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Dump {
    None,
    Tokens,
    Bytes,
}

fn main() {
    let mut mode: Option<OutputMode> = None;
    let mut args: Vec<String> = Vec::new();
    for arg in std::env::args() {
        match OutputMode::from_flag(&arg) {
            Some(_) if mode.is_some() => {
                eprintln!("error: --json, --text, and --ansi are mutually exclusive");
                std::process::exit(1);
            }
            Some(m) => mode = Some(m),
            None => args.push(arg),
        }
    }
    let mode = mode.unwrap_or_else(OutputMode::auto);
    let program = args.first().map(String::as_str).unwrap_or("tpv").to_string();

    if args.len() < 2 {
        usage(&program);
        std::process::exit(1);
    }

    match args[1].as_str() {
        "--version" | "-V" => {
            println!("tpv {}", env!("CARGO_PKG_VERSION"));
        }
        "-repl" => {
            repl::repl();
        }
        "-c" => {
            let mut dump = Dump::None;
            let mut files: Vec<&str> = Vec::new();
            for arg in &args[2..] {
                match arg.as_str() {
                    "--tokens" => dump = Dump::Tokens,
                    "--bytes" => dump = Dump::Bytes,
                    path => files.push(path),
                }
            }
            if files.is_empty() {
                usage(&program);
                std::process::exit(1);
            }

            let mut ok = true;
            for path in files {
                ok &= run_file(path, dump, mode);
            }
            std::process::exit(if ok { 0 } else { 1 });
        }
        other => {
            eprintln!("Unknown option: {other}");
            usage(&program);
            std::process::exit(1);
        }
    }
}

/// Read, scan, assemble, and (diagnostics permitting) run one source file.
/// Returns false when anything was reported.
fn run_file(path: &str, dump: Dump, mode: OutputMode) -> bool {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {path}: {e}");
            return false;
        }
    };

    let tokens = scanner::scan(&source);

    if dump == Dump::Tokens {
        match serde_json::to_string_pretty(&tokens) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                eprintln!("Serialization error: {e}");
                return false;
            }
        }
        return true;
    }

    let assembly = assembler::assemble(&tokens);
    if !assembly.errors.is_empty() {
        for e in &assembly.errors {
            report(&Diagnostic::from(e).with_source(source.clone()), mode);
        }
        return false;
    }

    if assembly.bytes.is_empty() {
        report(
            &Diagnostic::warning(format!("{path}: program is empty, nothing to run")),
            mode,
        );
        return true;
    }

    if dump == Dump::Bytes {
        match assembler::disassemble(&assembly.bytes) {
            Ok(instructions) => {
                for instr in &instructions {
                    println!("{instr}");
                }
            }
            Err(e) => {
                report(&Diagnostic::from(&e), mode);
                return false;
            }
        }
        return true;
    }

    let mut vm = Vm::new();
    if let Err(e) = vm.load_program(&assembly.bytes) {
        report(&Diagnostic::from(&e), mode);
        return false;
    }
    vm.run();

    for e in vm.errors() {
        report(&Diagnostic::from(e), mode);
    }
    vm.errors().is_empty()
}
