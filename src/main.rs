use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::Parser;

#[derive(Parser, Debug)]
struct Cli {
    /// Working directory, with config and data files.
    #[clap(short, long, default_value = "data")]
    dir: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Subcommand, Debug)]
enum Cmd {
    Server {
        /// Keep users and images in process memory instead of SQLite.
        #[clap(long)]
        memory: bool,
    },
    /// Generate one image and print its URL. Touches no quota.
    Generate { prompt: String },
    /// Print the effective configuration.
    Conf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    human_panic_setup();
    let cli = Cli::parse();
    set_current_dir(&cli.dir)?;
    load_dotenv(".env")?;
    pixgate::tracing::init()?;
    tracing::debug!(?cli, "Starting.");
    match &cli.cmd {
        Cmd::Server { memory } => pixgate::server::run(*memory).await,
        Cmd::Generate { prompt } => {
            let conf = pixgate::conf::global();
            let upstream = pixgate::upstream::Upstream::new(&conf.upstream)?;
            let url = upstream.generate(prompt).await?;
            println!("{url}");
            Ok(())
        }
        Cmd::Conf => {
            let conf = pixgate::conf::global();
            println!("{conf:#?}");
            Ok(())
        }
    }
}

fn set_current_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path)
        .context(format!("Failed to create directory path: {path:?}"))?;
    env::set_current_dir(path)
        .context(format!("Failed to set current directory to {path:?}"))?;
    Ok(())
}

/// A missing file is fine. A malformed one is not.
fn load_dotenv<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    match dotenvy::from_path(path) {
        Ok(()) => Ok(()),
        Err(error) if error.not_found() => Ok(()),
        Err(error) => {
            Err(error).context(format!("Failed to load env file: {path:?}"))
        }
    }
}

fn human_panic_setup() {
    macro_rules! repo {
        () => {
            env!("CARGO_PKG_REPOSITORY")
        };
    }
    human_panic::setup_panic!(human_panic::Metadata::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
    .authors(env!("CARGO_PKG_AUTHORS"))
    .homepage(repo!())
    .support(concat!("- Submit an issue at ", repo!(), "/issues")));
}
