use std::sync::Arc;
use std::{env, panic};

use anyhow::Result;
use clap::Parser;
use log::info;

use kv::engine::Engine;
use kvcli::command::{self, Command};
use kvcli::config::ConfigLoad;
use kvcli::trace;

/// CMD like:
///     kvcli put order_key xxx
///     kvcli get order_key
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[clap(short, long, help = "debug mode")]
    debug: bool,

    #[clap(short = 'c', long = "config", default_value = "kvcli.toml")]
    config: String,

    #[clap(long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    setup_panic_hooks();

    eprintln!();
    eprintln!("██  ██  █        █");
    eprintln!("██ ██   ██      ██");
    eprintln!("███      ██    ██");
    eprintln!("██ ██     ██  ██");
    eprintln!("██  ██     ████  KV Storage CLI");
    eprintln!();

    let args = Args::parse();
    if args.debug {
        println!("{:?}", args);
    }

    let mut cfg = match ConfigLoad::load(&args.config) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("using default config ({err}); pass --config to load a different one");
            ConfigLoad::default()
        }
    };
    cfg.log_level = args.log_level;
    if args.debug {
        println!("{:?}", &cfg);
        eprintln!();
    }

    let _guards = trace::init_logging(&cfg.log_dir, &cfg.log_level)?;
    info!("kvcli starting, config: {:?}", &cfg);

    let engine = Arc::new(Engine::open(cfg.engine_config())?);
    command::run(args.cmd, engine)
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();

    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);

            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}
