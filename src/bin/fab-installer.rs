use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use fab_installer::builder::{BuildOutcome, Builder};
use fab_installer::cache::credentials;
use fab_installer::cache::{ArtifactCache, ArtifactRef, Cancel, OciRegistry};
use fab_installer::config::{BuilderConfig, FabConfig, Wiring, BUILDER_CONFIG_FILE};
use fab_installer::error::{classify, FailureKind};
use fab_installer::target::{BuildMode, BuildTarget, NodeKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FAB_CONFIG: &str = "fab.yaml";
const DEFAULT_WIRING: &str = "wiring.yaml";

fn usage() -> &'static str {
    "Usage:\n  fab-installer [options] build <control|node> <name> <manual|usb|iso>\n  fab-installer [options] build-all <manual|usb|iso>\n  fab-installer [options] fetch <name:version>...\n\nOptions:\n  --config <path>   builder settings (default: builder.toml)\n  --fab <path>      cluster and node description (default: fab.yaml)\n  --wiring <path>   wiring document (default: wiring.yaml)\n  -v, -vv           more logging (RUST_LOG overrides)"
}

struct Options {
    config: PathBuf,
    fab: PathBuf,
    wiring: PathBuf,
    verbose: u8,
    command: Vec<String>,
}

fn parse_options(args: Vec<String>) -> Result<Options> {
    let mut opts = Options {
        config: PathBuf::from(BUILDER_CONFIG_FILE),
        fab: PathBuf::from(DEFAULT_FAB_CONFIG),
        wiring: PathBuf::from(DEFAULT_WIRING),
        verbose: 0,
        command: Vec::new(),
    };
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "--fab" | "--wiring" => {
                let value = args
                    .next()
                    .with_context(|| format!("{arg} needs a value\n\n{}", usage()))?;
                let slot = match arg.as_str() {
                    "--config" => &mut opts.config,
                    "--fab" => &mut opts.fab,
                    _ => &mut opts.wiring,
                };
                *slot = PathBuf::from(value);
            }
            "-v" => opts.verbose += 1,
            "-vv" => opts.verbose += 2,
            "-h" | "--help" => bail!(usage()),
            _ => opts.command.push(arg),
        }
    }
    Ok(opts)
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("fab_installer=warn"),
        1 => EnvFilter::new("fab_installer=info"),
        _ => EnvFilter::new("fab_installer=debug"),
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = parse_options(args).and_then(|opts| {
        init_logging(opts.verbose);
        run(&opts)
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            match classify(&e) {
                FailureKind::Configuration => ExitCode::from(2),
                FailureKind::Transient => {
                    eprintln!("This failure may be temporary; retrying the build can help.");
                    ExitCode::FAILURE
                }
                FailureKind::Integrity | FailureKind::Cancelled => ExitCode::FAILURE,
            }
        }
    }
}

fn run(opts: &Options) -> Result<()> {
    let config = BuilderConfig::load(&opts.config)?;
    let args: Vec<&str> = opts.command.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["build", kind, name, mode] => {
            let target = BuildTarget::new(kind.parse::<NodeKind>()?, *name, mode.parse()?)?;
            let builder = open_builder(config, opts)?;
            report(&target, builder.build(&target)?);
            Ok(())
        }
        ["build-all", mode] => {
            let mode: BuildMode = mode.parse()?;
            let builder = open_builder(config, opts)?;
            for target in builder.targets(mode)? {
                report(&target, builder.build(&target)?);
            }
            Ok(())
        }
        ["fetch", refs @ ..] if !refs.is_empty() => {
            let cache = open_cache(&config)?;
            let cancel = Cancel::new();
            for raw in refs {
                let artifact: ArtifactRef = raw.parse()?;
                let path = cache.fetch(&artifact, &cancel)?;
                println!("{artifact} {}", path.display());
            }
            Ok(())
        }
        _ => bail!(usage()),
    }
}

fn open_cache(config: &BuilderConfig) -> Result<ArtifactCache> {
    let registry = OciRegistry::new(&config.registry, credentials::from_env())?;
    ArtifactCache::new(&config.cache_dir, Arc::new(registry))
}

fn open_builder(config: BuilderConfig, opts: &Options) -> Result<Builder> {
    let fab = FabConfig::load(&opts.fab)?;
    let wiring = Wiring::load(&opts.wiring)?;
    let cache = Arc::new(open_cache(&config)?);
    info!("Artifact cache at {}", cache.root().display());
    Ok(Builder::new(config, fab, wiring, cache))
}

fn report(target: &BuildTarget, outcome: BuildOutcome) {
    match outcome {
        BuildOutcome::Built => println!("[{target}] built"),
        BuildOutcome::UpToDate => println!("[{target}] up to date"),
    }
}
