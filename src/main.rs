//! Command-line interface for pageshot
//!
//! Usage:
//!   pageshot capture `<html>` [--out `<file>`] [--url `<url>`] [--assign-ids] [--stats]
//!   pageshot render `<snapshot>` [--offline]
//!   pageshot diff `<a>` `<b>`
//!   pageshot transition `<a>` `<b>` [--offline]

use std::fs;

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};

use pageshot::{Dom, NoNetworkLoader, ResourceLoader, Session, SessionConfig, Snapshot};

fn cli() -> Command {
    let offline = Arg::new("offline")
        .long("offline")
        .help("Never fetch external style sheets")
        .action(ArgAction::SetTrue);

    Command::new("pageshot")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Capture pages as snapshots, rebuild them and transition between them")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("capture")
                .about("Capture an HTML file as snapshot JSON")
                .arg(Arg::new("html").help("Path to the HTML file").required(true).index(1))
                .arg(Arg::new("out").long("out").short('o').help("Write the snapshot here instead of stdout"))
                .arg(Arg::new("url").long("url").help("URL recorded in the snapshot"))
                .arg(
                    Arg::new("assign-ids")
                        .long("assign-ids")
                        .help("Stamp identities onto nodes that have none before capturing")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("stats")
                        .long("stats")
                        .help("Print style statistics to stderr")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("render")
                .about("Rebuild a snapshot and print the resulting markup")
                .arg(Arg::new("snapshot").help("Path to snapshot JSON").required(true).index(1))
                .arg(offline.clone()),
        )
        .subcommand(
            Command::new("diff")
                .about("Print the edit script between two snapshots")
                .arg(Arg::new("a").help("Older snapshot").required(true).index(1))
                .arg(Arg::new("b").help("Newer snapshot").required(true).index(2)),
        )
        .subcommand(
            Command::new("transition")
                .about("Rebuild the older snapshot, patch it to the newer one and print the markup")
                .arg(Arg::new("a").help("Older snapshot").required(true).index(1))
                .arg(Arg::new("b").help("Newer snapshot").required(true).index(2))
                .arg(offline),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("capture", m)) => handle_capture(m),
        Some(("render", m)) => handle_render(m).await,
        Some(("diff", m)) => handle_diff(m),
        Some(("transition", m)) => handle_transition(m).await,
        _ => unreachable!("a subcommand is required"),
    }
}

fn arg<'a>(m: &'a ArgMatches, name: &str) -> &'a str {
    m.get_one::<String>(name).map(String::as_str).unwrap_or_default()
}

fn read_snapshot(path: &str) -> anyhow::Result<Snapshot> {
    let json = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    Snapshot::from_json(&json).with_context(|| format!("parsing {}", path))
}

fn loader(config: &SessionConfig, offline: bool) -> anyhow::Result<Box<dyn ResourceLoader>> {
    if offline {
        return Ok(Box::new(NoNetworkLoader));
    }
    #[cfg(feature = "http")]
    {
        Ok(Box::new(pageshot::HttpLoader::new(config)?))
    }
    #[cfg(not(feature = "http"))]
    {
        let _ = config;
        Ok(Box::new(NoNetworkLoader))
    }
}

fn report_diagnostics(session: &mut Session) {
    for d in session.take_diagnostics() {
        eprintln!("{:?}: {}", d.severity, d.message);
    }
}

fn handle_capture(m: &ArgMatches) -> anyhow::Result<()> {
    let path = arg(m, "html");
    let html = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let config = SessionConfig {
        base_url: m.get_one::<String>("url").cloned(),
        ..Default::default()
    };
    let mut session = Session::new(config)?;

    let (mut dom, doc) = Dom::parse_document(&html);
    if m.get_flag("assign-ids") {
        let issued = session.assign_identities(&mut dom, doc);
        eprintln!("assigned {} identities", issued);
    }
    let capture = pageshot::serialize(&mut session, &dom, doc)?;
    report_diagnostics(&mut session);

    if m.get_flag("stats") {
        eprintln!("{}", serde_json::to_string_pretty(&capture.stats)?);
    }
    let json = capture.snapshot.to_json_pretty()?;
    match m.get_one::<String>("out") {
        Some(out) => fs::write(out, json).with_context(|| format!("writing {}", out))?,
        None => println!("{}", json),
    }
    Ok(())
}

async fn handle_render(m: &ArgMatches) -> anyhow::Result<()> {
    let snapshot = read_snapshot(arg(m, "snapshot"))?;
    let mut session = Session::new(SessionConfig::default())?;
    let loader = loader(&session.config, m.get_flag("offline"))?;

    let mut dom = Dom::new();
    let container = dom.create_document();
    let report = pageshot::reconstruct(&mut session, &mut dom, &snapshot, container, loader.as_ref()).await?;
    report_diagnostics(&mut session);
    eprintln!("{:?}", report);
    println!("{}", dom.to_html(container));
    Ok(())
}

fn handle_diff(m: &ArgMatches) -> anyhow::Result<()> {
    let a = read_snapshot(arg(m, "a"))?;
    let b = read_snapshot(arg(m, "b"))?;
    let script = pageshot::diff(&a, &b)?;
    println!("{}", serde_json::to_string_pretty(&script)?);
    Ok(())
}

async fn handle_transition(m: &ArgMatches) -> anyhow::Result<()> {
    let a = read_snapshot(arg(m, "a"))?;
    let b = read_snapshot(arg(m, "b"))?;
    let mut session = Session::new(SessionConfig::default())?;
    let loader = loader(&session.config, m.get_flag("offline"))?;

    let mut dom = Dom::new();
    let container = dom.create_document();
    pageshot::reconstruct(&mut session, &mut dom, &a, container, loader.as_ref()).await?;
    let script = pageshot::transition(&mut session, &mut dom, &a, &b, container, loader.as_ref()).await?;
    report_diagnostics(&mut session);
    eprintln!("applied {} edits", script.edit_count());
    println!("{}", dom.to_html(container));
    Ok(())
}
