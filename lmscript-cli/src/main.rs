use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, info, warn, LevelFilter};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use lmscript_core::translate::{units_from_json, units_to_json};
use lmscript_core::{CommandKind, Compiler, Decompiler, LsbError, Order, Script};

#[derive(Debug, Error)]
enum CliError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Lsb {
        path: PathBuf,
        #[source]
        source: LsbError,
    },

    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line} of {path} is not a TextIns command")]
    NotText { path: PathBuf, line: u32 },

    #[error("{0} of {1} files failed validation")]
    Validation(usize, usize),
}

type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Parser)]
#[command(name = "lmlsb", version, about = "Inspect, translate and edit LiveMaker LSB scripts")]
struct Args {
    /// More log output (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DumpFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Print the commands of a script.
    Dump {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = DumpFormat::Text)]
        format: DumpFormat,
    },

    /// Check that scripts survive a parse and write unchanged.
    Validate {
        /// Files or directories (searched for *.lsb).
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Write translatable text and menu choices as JSON.
    Extract {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Order units roughly as the game runs them.
        #[arg(long)]
        run_order: bool,
    },

    /// Apply translated JSON units to a script.
    Insert {
        file: PathBuf,
        units: PathBuf,
        /// Defaults to rewriting FILE in place, keeping a .bak copy.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print one TextIns command as LNS markup.
    Lns {
        file: PathBuf,
        line: u32,
        #[arg(long)]
        text_only: bool,
        #[arg(long)]
        no_comments: bool,
    },

    /// Replace one TextIns command with compiled LNS markup.
    Edit {
        file: PathBuf,
        line: u32,
        lns: PathBuf,
        #[arg(long)]
        text_only: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write the control flow graph in DOT format.
    Graph {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_logging(verbose: u8) -> std::result::Result<(), log::SetLoggerError> {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn lsb_err(path: &Path) -> impl Fn(LsbError) -> CliError + '_ {
    move |source| CliError::Lsb {
        path: path.to_path_buf(),
        source,
    }
}

/// Jump targets name scripts by file name, so that is the call name.
fn call_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

fn load(path: &Path) -> Result<Script> {
    let bytes = read(path)?;
    Script::parse(&bytes, &call_name(path)).map_err(lsb_err(path))
}

/// Write `script` to `output`, or over `input` after keeping a backup.
fn save(script: &Script, input: &Path, output: Option<&Path>) -> Result<()> {
    let bytes = script.to_bytes().map_err(lsb_err(input))?;
    let target = match output {
        Some(path) => path.to_path_buf(),
        None => {
            let mut backup = input.as_os_str().to_owned();
            backup.push(".bak");
            let backup = PathBuf::from(backup);
            fs::copy(input, &backup).map_err(|source| CliError::Io {
                path: backup.clone(),
                source,
            })?;
            info!("backed up {} to {}", input.display(), backup.display());
            input.to_path_buf()
        }
    };
    write(&target, &bytes)?;
    info!("wrote {}", target.display());
    Ok(())
}

fn emit(text: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => write(path, text.as_bytes()),
        None => {
            println!("{}", text);
            Ok(())
        }
    }
}

fn dump(file: &Path, format: DumpFormat) -> Result<()> {
    let script = load(file)?;
    match format {
        DumpFormat::Json => {
            let json = serde_json::to_string_pretty(&script).map_err(|source| CliError::Json {
                path: file.to_path_buf(),
                source,
            })?;
            println!("{}", json);
        }
        DumpFormat::Text => {
            println!(
                "{}: LSB version {} (LiveMaker {}), {} commands",
                script.call_name,
                script.version,
                lmscript_core::lm_version(script.version),
                script.len()
            );
            for cmd in &script.commands {
                println!("{}", cmd);
            }
        }
    }
    Ok(())
}

fn validate_one(path: &Path) -> Result<()> {
    let bytes = read(path)?;
    let script = Script::parse(&bytes, &call_name(path)).map_err(lsb_err(path))?;
    let written = script.to_bytes().map_err(lsb_err(path))?;
    if written != bytes {
        let at = written.iter().zip(&bytes).position(|(a, b)| a != b).unwrap_or(written.len().min(bytes.len()));
        return Err(CliError::Lsb {
            path: path.to_path_buf(),
            source: LsbError::Unsupported(format!("rewritten script differs from the original at byte {:#x}", at)),
        });
    }
    Ok(())
}

fn validate(paths: &[PathBuf]) -> Result<()> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
                let p = entry.path();
                if p.is_file() && p.extension().is_some_and(|e| e.eq_ignore_ascii_case("lsb")) {
                    files.push(p.to_path_buf());
                }
            }
        } else {
            files.push(path.clone());
        }
    }
    let mut failed = 0;
    for file in &files {
        match validate_one(file) {
            Ok(()) => println!("ok      {}", file.display()),
            Err(err) => {
                failed += 1;
                println!("FAILED  {}", err);
            }
        }
    }
    println!("{} files, {} failed", files.len(), failed);
    if failed > 0 {
        return Err(CliError::Validation(failed, files.len()));
    }
    Ok(())
}

fn extract(file: &Path, output: Option<&Path>, run_order: bool) -> Result<()> {
    let script = load(file)?;
    let order = if run_order { Order::Run } else { Order::File };
    let units = script.translation_units(order);
    info!("{}: {} translatable units", file.display(), units.len());
    let json = units_to_json(&units).map_err(|source| CliError::Json {
        path: file.to_path_buf(),
        source,
    })?;
    emit(&json, output)
}

fn insert(file: &Path, units_path: &Path, output: Option<&Path>) -> Result<()> {
    let mut script = load(file)?;
    let units = units_from_json(&read_text(units_path)?).map_err(|source| CliError::Json {
        path: units_path.to_path_buf(),
        source,
    })?;
    let report = script.apply_translations(&units);
    for err in &report.errors {
        warn!("{}", err);
    }
    println!("{}: {}", file.display(), report);
    if report.translated > 0 {
        save(&script, file, output)?;
    } else {
        debug!("nothing translated, {} left unchanged", file.display());
    }
    Ok(())
}

fn text_at(script: &Script, path: &Path, line: u32) -> Result<usize> {
    match script.command_at_line(line) {
        Some((index, cmd)) if matches!(cmd.kind, CommandKind::TextIns(_)) => Ok(index),
        _ => Err(CliError::NotText {
            path: path.to_path_buf(),
            line,
        }),
    }
}

fn lns(file: &Path, line: u32, text_only: bool, no_comments: bool) -> Result<()> {
    let script = load(file)?;
    let index = text_at(&script, file, line)?;
    let CommandKind::TextIns(ins) = &script.commands[index].kind else {
        return Err(CliError::NotText {
            path: file.to_path_buf(),
            line,
        });
    };
    let decompiler = Decompiler {
        include_comments: !no_comments,
        text_only,
        ..Decompiler::default()
    };
    let text = decompiler.decompile(&ins.text).map_err(lsb_err(file))?;
    println!("{}", text);
    Ok(())
}

fn edit(file: &Path, line: u32, lns_path: &Path, text_only: bool, output: Option<&Path>) -> Result<()> {
    let mut script = load(file)?;
    let index = text_at(&script, file, line)?;
    let markup = read_text(lns_path)?;
    let CommandKind::TextIns(ins) = &mut script.commands[index].kind else {
        return Err(CliError::NotText {
            path: file.to_path_buf(),
            line,
        });
    };
    let compiled = Compiler::new()
        .version(ins.text.version)
        .text_only(text_only)
        .compile(&markup)
        .map_err(lsb_err(lns_path))?;
    info!("compiled {} glyphs", compiled.body.len());
    compiled.apply(&mut ins.text).map_err(lsb_err(lns_path))?;
    save(&script, file, output)
}

fn graph(file: &Path, output: Option<&Path>) -> Result<()> {
    let script = load(file)?;
    emit(&script.flow_dot(), output)
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Cmd::Dump { file, format } => dump(&file, format),
        Cmd::Validate { paths } => validate(&paths),
        Cmd::Extract {
            file,
            output,
            run_order,
        } => extract(&file, output.as_deref(), run_order),
        Cmd::Insert { file, units, output } => insert(&file, &units, output.as_deref()),
        Cmd::Lns {
            file,
            line,
            text_only,
            no_comments,
        } => lns(&file, line, text_only, no_comments),
        Cmd::Edit {
            file,
            line,
            lns,
            text_only,
            output,
        } => edit(&file, line, &lns, text_only, output.as_deref()),
        Cmd::Graph { file, output } => graph(&file, output.as_deref()),
    }
}

fn main() {
    let args = Args::parse();
    if let Err(err) = init_logging(args.verbose) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
    if let Err(err) = run(args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
