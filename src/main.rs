use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use embedpm::cache::ContentCache;
use embedpm::config::{HTTP_CACHE_NAMESPACE, Settings};
use embedpm::logging::init_logging;
use embedpm::manager::{
    DependencyReport, DependencyStatus, DependencyUninstall, InstallOptions, InstallOutcome,
    PlatformManager, UpdateOutcome,
};
use embedpm::package::{InstalledPackage, PackageKind, PackageSpec};

#[derive(Parser)]
#[command(name = "embedpm")]
#[command(version, about = "Package and platform manager for embedded toolchains")]
struct Cli {
    /// Core directory holding the stores, caches and settings
    #[arg(long, global = true)]
    core_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install packages, cascading platform dependencies
    Install {
        specs: Vec<String>,
        #[arg(short, long, default_value = "platform")]
        kind: PackageKind,
        #[arg(long)]
        skip_dependencies: bool,
        #[arg(short, long)]
        force: bool,
    },
    /// Uninstall packages; platforms keep dependencies others still need
    Uninstall {
        specs: Vec<String>,
        #[arg(short, long, default_value = "platform")]
        kind: PackageKind,
        #[arg(long)]
        skip_dependencies: bool,
    },
    /// Update installed packages to the newest satisfying version
    Update {
        specs: Vec<String>,
        #[arg(short, long, default_value = "platform")]
        kind: PackageKind,
        #[arg(long)]
        skip_dependencies: bool,
    },
    /// List installed packages
    List {
        #[arg(short, long)]
        kind: Option<PackageKind>,
    },
    /// List boards of installed and registered platforms
    Boards {
        /// Show only boards of installed platforms
        #[arg(long)]
        installed: bool,
    },
    /// Remove unneeded tools and abandoned staging areas
    Prune {
        #[arg(long)]
        dry_run: bool,
    },
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Drop cached registry responses
    Clean,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.core_dir {
        Some(dir) => Settings::load(dir),
        None => Settings::from_env(),
    };
    let _guard = init_logging(&settings.log_path(), cli.verbose)
        .context("failed to initialize logging")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli.command, settings))
}

async fn run(command: Command, settings: Settings) -> anyhow::Result<()> {
    if let Command::Cache {
        action: CacheAction::Clean,
    } = command
    {
        let cache = ContentCache::new(&settings.cache_db_path())?;
        let removed = cache.invalidate(HTTP_CACHE_NAMESPACE)?;
        println!("Removed {} cached responses", removed);
        return Ok(());
    }

    let manager = PlatformManager::from_settings(&settings)?;
    match command {
        Command::Install {
            specs,
            kind,
            skip_dependencies,
            force,
        } => {
            for spec in parse_specs(kind, &specs)? {
                if kind == PackageKind::Platform {
                    let options = InstallOptions {
                        skip_dependencies,
                        force,
                    };
                    let result = manager.install(&spec, options).await?;
                    print_install(&result.outcome);
                    print_dependencies(&result.dependencies);
                } else {
                    let outcome = manager.manager_for(kind).install(&spec, force).await?;
                    print_install(&outcome);
                }
            }
        }
        Command::Uninstall {
            specs,
            kind,
            skip_dependencies,
        } => {
            for spec in parse_specs(kind, &specs)? {
                if kind == PackageKind::Platform {
                    let result = manager.uninstall(&spec, skip_dependencies).await?;
                    println!("Uninstalled {}", describe(&result.package));
                    for pkg in &result.removed {
                        println!("  removed {}", describe(pkg));
                    }
                    for retained in &result.retained {
                        println!("  kept {} ({})", describe(&retained.package), retained.reason);
                    }
                } else {
                    match manager.uninstall_dependency(&spec).await? {
                        DependencyUninstall::Removed(pkg) => {
                            println!("Uninstalled {}", describe(&pkg))
                        }
                        DependencyUninstall::Retained(retained) => {
                            println!("Kept {} ({})", describe(&retained.package), retained.reason)
                        }
                    }
                }
            }
        }
        Command::Update {
            specs,
            kind,
            skip_dependencies,
        } => {
            let targets = if specs.is_empty() {
                manager
                    .manager_for(kind)
                    .list()?
                    .iter()
                    .filter_map(InstalledPackage::spec)
                    .collect()
            } else {
                parse_specs(kind, &specs)?
            };
            for spec in targets {
                if kind == PackageKind::Platform {
                    let result = manager.update(&spec, None, skip_dependencies).await?;
                    print_update(&result.outcome);
                    print_dependencies(&result.dependencies);
                } else {
                    let outcome = manager.manager_for(kind).update(&spec, None).await?;
                    print_update(&outcome);
                }
            }
        }
        Command::List { kind } => {
            let kinds = match kind {
                Some(kind) => vec![kind],
                None => vec![PackageKind::Platform, PackageKind::Tool, PackageKind::Library],
            };
            for kind in kinds {
                for pkg in manager.manager_for(kind).list()? {
                    println!("{:<8} {:<32} {:<20} {}", kind, pkg.name(), pkg.version(), pkg.path.display());
                }
            }
        }
        Command::Boards { installed } => {
            let boards = if installed {
                manager.installed_boards()?
            } else {
                manager.all_boards().await?
            };
            for board in boards {
                println!(
                    "{:<28} {:<20} {:<16} {}",
                    board.id,
                    board.platform.as_deref().unwrap_or("-"),
                    board.mcu.as_deref().unwrap_or("-"),
                    board.name
                );
            }
        }
        Command::Prune { dry_run } => {
            let packages = manager.remove_unnecessary_packages(dry_run).await?;
            let verb = if dry_run { "Would remove" } else { "Removed" };
            for pkg in &packages {
                println!("{} {}", verb, describe(pkg));
            }
            if !dry_run {
                for path in manager.prune_orphans()? {
                    println!("Cleaned {}", path.display());
                }
            }
        }
        Command::Cache { .. } => {}
    }
    Ok(())
}

fn parse_specs(kind: PackageKind, specs: &[String]) -> anyhow::Result<Vec<PackageSpec>> {
    if specs.is_empty() {
        anyhow::bail!("no package specified");
    }
    specs
        .iter()
        .map(|raw| PackageSpec::parse(kind, raw).map_err(Into::into))
        .collect()
}

fn describe(pkg: &InstalledPackage) -> String {
    format!("{} @ {}", pkg.name(), pkg.version())
}

fn print_install(outcome: &InstallOutcome) {
    match outcome {
        InstallOutcome::Installed(pkg) => println!("Installed {}", describe(pkg)),
        InstallOutcome::AlreadyInstalled(pkg) => {
            println!("{} is already installed", describe(pkg))
        }
    }
}

fn print_update(outcome: &UpdateOutcome) {
    match outcome {
        UpdateOutcome::UpToDate(pkg) => println!("{} is up to date", describe(pkg)),
        UpdateOutcome::Updated { from, to } => {
            println!("Updated {} to {}", describe(from), to.version())
        }
    }
}

fn print_dependencies(reports: &[DependencyReport]) {
    for report in reports {
        match &report.status {
            DependencyStatus::Installed(pkg) => println!("  installed {}", describe(pkg)),
            DependencyStatus::AlreadyInstalled(pkg) => println!("  found {}", describe(pkg)),
            DependencyStatus::SkippedOptional => println!("  skipped optional {}", report.name),
            DependencyStatus::Failed(message) => {
                eprintln!("  failed {}: {}", report.name, message)
            }
        }
    }
}
