//! container-cli — a small inspection/editing CLI over the container core.
//!
//! Opens an EPUB or KF8/MOBI book, exercises the common operations
//! (list manifest/spine, rename a file, add a file, clone, commit), and
//! re-writes the book to a path of the caller's choice (spec.md §5).
//! This is deliberately thin: it is an external collaborator of the core,
//! not the multi-format conversion CLI the teacher's own stack builds.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use container_epub::EpubContainer;
use container_kf8::{ExternalKf8Worker, Kf8Container};

#[derive(Parser)]
#[command(name = "container-cli", version, about = "Inspect and edit OPF-based ebooks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Working directory to explode/extract the book into (defaults to a temp dir)
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List every manifest item and the spine order
    List { input: PathBuf },
    /// Rename a file inside the book and write the result
    Rename {
        input: PathBuf,
        current: String,
        new: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Add a file to the book and write the result
    AddFile {
        input: PathBuf,
        name: String,
        source: PathBuf,
        #[arg(long)]
        media_type: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Clone the book into a fresh working directory, then report any diff
    Clone { input: PathBuf, dest: PathBuf },
    /// Re-write the book unchanged (round-trip check)
    Commit {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Persisted options: default output directory, parse-cache retention on
/// commit, and the default `tweak_mode` flag, per SPEC_FULL.md's ambient
/// stack section.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CliConfig {
    #[serde(default)]
    output_dir: Option<PathBuf>,
    #[serde(default)]
    keep_parsed_after_commit: bool,
    #[serde(default)]
    tweak_mode: bool,
}

/// Load config from the global and project-local TOML files. The
/// project-local file fully overrides the global one when present,
/// mirroring the teacher's own two-layer config merge.
fn load_config() -> CliConfig {
    let mut config = CliConfig::default();

    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("container-cli").join("config.toml");
        if let Ok(contents) = std::fs::read_to_string(&global_path) {
            match toml::from_str::<CliConfig>(&contents) {
                Ok(parsed) => config = parsed,
                Err(e) => log::warn!("failed to parse {}: {e}", global_path.display()),
            }
        }
    }

    let local_path = PathBuf::from(".container-cli.toml");
    if let Ok(contents) = std::fs::read_to_string(&local_path) {
        match toml::from_str::<CliConfig>(&contents) {
            Ok(parsed) => config = parsed,
            Err(e) => log::warn!("failed to parse {}: {e}", local_path.display()),
        }
    }

    config
}

/// The two book flavors this CLI can open, dispatched by tagged variant
/// rather than a trait object, per DESIGN NOTES' polymorphism guidance.
enum Book {
    Epub(EpubContainer),
    Kf8(Kf8Container),
}

impl Book {
    fn open(input: &PathBuf, work_dir: PathBuf) -> Result<Self> {
        let ext = input
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "epub" => Ok(Book::Epub(
                EpubContainer::open(input, work_dir).context("failed to open EPUB")?,
            )),
            "mobi" | "azw" | "azw3" => Ok(Book::Kf8(
                Kf8Container::open(input, work_dir, &ExternalKf8Worker::default())
                    .context("failed to open KF8/MOBI book")?,
            )),
            other => anyhow::bail!("unrecognized book extension: {other:?} (expected epub/mobi/azw/azw3)"),
        }
    }

    fn manifest_and_spine(&mut self) -> Result<(Vec<(String, String)>, Vec<String>)> {
        let base = match self {
            Book::Epub(c) => &mut c.base,
            Book::Kf8(c) => &mut c.base,
        };
        let ids = base.manifest_id_map()?;
        let manifest: Vec<(String, String)> = ids.into_iter().collect();
        let spine = base
            .spine_iter()?
            .into_iter()
            .map(|(_, name, _)| name)
            .collect();
        Ok((manifest, spine))
    }

    fn rename(&mut self, current: &str, new: &str) -> Result<()> {
        match self {
            Book::Epub(c) => c.rename(current, new)?,
            Book::Kf8(c) => c.base.rename(current, new)?,
        }
        Ok(())
    }

    fn add_file(&mut self, name: &str, data: &[u8], media_type: Option<&str>) -> Result<()> {
        let base = match self {
            Book::Epub(c) => &mut c.base,
            Book::Kf8(c) => &mut c.base,
        };
        base.add_file(name, data, media_type)?;
        Ok(())
    }

    fn commit(&mut self, output: &PathBuf) -> Result<()> {
        match self {
            Book::Epub(c) => c.commit(output)?,
            Book::Kf8(c) => c.commit(output, &ExternalKf8Worker::default())?,
        }
        Ok(())
    }

    fn default_output(&self) -> Option<PathBuf> {
        match self {
            Book::Epub(c) => c.path_to_ebook().map(|p| p.to_path_buf()),
            Book::Kf8(c) => c.path_to_ebook().map(|p| p.to_path_buf()),
        }
    }
}

fn work_dir_for(cli: &Cli, label: &str) -> Result<PathBuf> {
    match &cli.work_dir {
        Some(dir) => Ok(dir.clone()),
        None => {
            let dir = std::env::temp_dir().join(format!("container-cli-{label}-{}", process::id()));
            Ok(dir)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = load_config();
    log::debug!("loaded config: {config:?}");

    match &cli.command {
        Commands::List { input } => {
            let work_dir = work_dir_for(cli, "list")?;
            let mut book = Book::open(input, work_dir)?;
            let (manifest, spine) = book.manifest_and_spine()?;
            println!("Manifest:");
            for (id, name) in &manifest {
                println!("  {id}  {name}");
            }
            println!("Spine:");
            for name in &spine {
                println!("  {name}");
            }
        }
        Commands::Rename { input, current, new, output } => {
            let work_dir = work_dir_for(cli, "rename")?;
            let mut book = Book::open(input, work_dir)?;
            book.rename(current, new)?;
            let out = output
                .clone()
                .or_else(|| book.default_output())
                .context("no output path given and the book has no default path")?;
            book.commit(&out)?;
            log::info!("renamed {current} -> {new}, wrote {}", out.display());
        }
        Commands::AddFile { input, name, source, media_type, output } => {
            let work_dir = work_dir_for(cli, "add-file")?;
            let mut book = Book::open(input, work_dir)?;
            let data = std::fs::read(source)
                .with_context(|| format!("failed to read {}", source.display()))?;
            book.add_file(name, &data, media_type.as_deref())?;
            let out = output
                .clone()
                .or_else(|| book.default_output())
                .context("no output path given and the book has no default path")?;
            book.commit(&out)?;
            log::info!("added {name}, wrote {}", out.display());
        }
        Commands::Clone { input, dest } => {
            let work_dir = work_dir_for(cli, "clone")?;
            let mut book = Book::open(input, work_dir)?;
            match &mut book {
                Book::Epub(c) => {
                    let mut cloned = c.clone_data(dest)?;
                    let diff = c.base.compare_to(&cloned.base);
                    report_diff(&diff);
                    let _ = &mut cloned;
                }
                Book::Kf8(c) => {
                    let state = c.base.clone_data(dest)?;
                    let cloned = container_core::BaseContainer::from_cloned_state(state);
                    let diff = c.base.compare_to(&cloned);
                    report_diff(&diff);
                }
            }
        }
        Commands::Commit { input, output } => {
            let work_dir = work_dir_for(cli, "commit")?;
            let mut book = Book::open(input, work_dir)?;
            let out = output
                .clone()
                .or_else(|| book.default_output())
                .context("no output path given and the book has no default path")?;
            book.commit(&out)?;
            log::info!("wrote {}", out.display());
        }
    }

    Ok(())
}

fn report_diff(diff: &[String]) {
    if diff.is_empty() {
        println!("clone is identical to source");
    } else {
        println!("clone differs:");
        for line in diff {
            println!("  {line}");
        }
    }
}
