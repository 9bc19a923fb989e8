//! # loadtrace - Main Entry Point
//!
//! - **Check** (`--check`): print platform capabilities and the unwind
//!   metadata of the given libraries
//! - **Watch** (`--watch NAME ... LIBRARY ...`): watch the names, load the
//!   libraries through the platform loader and report who loaded what
//!
//! Reports go to `--report FILE` if given, otherwise to the debug channel
//! (standard error outside Windows).

use anyhow::{bail, Result};
use clap::Parser;
use log::warn;

use loadtrace::cli::Args;
use loadtrace::library::Library;
use loadtrace::preflight::{
    check_loader_notifications, check_unwind_metadata, detect_capabilities, UnwindMetadata,
};
use loadtrace::tracking::Tracker;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.to_string().to_lowercase().contains("nothing to do") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    if args.check {
        return run_check(&args);
    }

    if args.watch.is_empty() && args.libraries.is_empty() {
        bail!(
            "Nothing to do: give --watch names and/or libraries to load\n\n\
             Usage:\n  \
             loadtrace --check                       Show platform capabilities\n  \
             loadtrace --watch foo.dll foo.dll       Report who loads foo.dll\n\n\
             Run 'loadtrace --help' for more options"
        );
    }

    run_watch(&args)
}

fn run_check(args: &Args) -> Result<()> {
    let caps = detect_capabilities();
    print!("{caps}");

    for path in &args.libraries {
        match check_unwind_metadata(path)? {
            UnwindMetadata::Present { section, size } => {
                println!("{}: {section} ({size} bytes)", path.display());
            }
            UnwindMetadata::Missing => {
                let path = path.display();
                println!("{path}: no unwind tables; stacks through it will be cut short");
            }
            UnwindMetadata::NotAnObject => println!("{}: not an object file", path.display()),
        }
    }
    Ok(())
}

fn run_watch(args: &Args) -> Result<()> {
    let config = args.tracker_config();
    let mode = config.mode;
    let tracker = Tracker::new(config);

    if !args.watch.is_empty() {
        if let Err(e) = check_loader_notifications(&detect_capabilities()) {
            warn!("{e}");
        }
    }

    for name in &args.watch {
        if !tracker.watch(name, true) {
            eprintln!("warning: not watching {name}");
        }
    }

    let report = tracker.report_path();
    if report.as_os_str().is_empty() {
        println!("report: debug output");
    } else {
        println!("report: {}", report.display());
    }
    println!("mode: {mode:?}");

    // Held until the summary has been printed
    let mut loaded = Vec::with_capacity(args.libraries.len());
    for path in &args.libraries {
        let library = Library::open(path)?;
        println!("loaded: {}", library.path().display());
        loaded.push(library);
    }

    for name in &args.watch {
        let state = if tracker.is_watched(name) { "watching" } else { "not watching" };
        println!("{name}: {state}");
    }
    println!("hook installed: {}", tracker.is_hook_installed());

    drop(tracker);
    drop(loaded);
    Ok(())
}
