mod dataset;
mod process;
mod review;
mod session;

use anyhow::Result;
use console::style;

use crate::core::terminal::{self, GuideSection, print_error};
use session::Session;

const DEFAULT_ANNOTATOR: &str = "cli";

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Data")
        .command("import <file> [--gold]", "Load a JSON or JSON-lines dataset")
        .print();

    GuideSection::new("Loop")
        .command("run", "Start or resume the loop until it needs you")
        .command("status [--json]", "Show the current iteration")
        .command("report", "Show the final metric report")
        .print();

    GuideSection::new("Review")
        .command("review", "Show one proposal awaiting a decision")
        .command(
            "validate --sample <id> --accept|--reject",
            "Record a decision [--annotator <name>]",
        )
        .print();

    println!(
        "\n {} {} <command> [--verbose]\n",
        style("Usage:").bold(),
        style("labelloop").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImportArgs {
    pub path: Option<String>,
    pub gold: bool,
}

pub(crate) fn parse_import_args(args: &[String], start: usize) -> ImportArgs {
    let mut path = None;
    let mut gold = false;
    for arg in args.iter().skip(start) {
        match arg.as_str() {
            "--gold" | "-g" => gold = true,
            "--verbose" | "-v" => {}
            other if path.is_none() && !other.starts_with('-') => path = Some(other.to_string()),
            _ => {}
        }
    }
    ImportArgs { path, gold }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ValidateArgs {
    pub sample: Option<String>,
    pub accept: Option<bool>,
    pub annotator: String,
}

pub(crate) fn parse_validate_args(args: &[String], start: usize) -> ValidateArgs {
    let mut sample = None;
    let mut accept = None;
    let mut annotator = DEFAULT_ANNOTATOR.to_string();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--sample" | "-s" => {
                if i + 1 < args.len() {
                    sample = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--annotator" | "-a" => {
                if i + 1 < args.len() {
                    annotator = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--accept" => {
                accept = Some(true);
                i += 1;
            }
            "--reject" => {
                accept = Some(false);
                i += 1;
            }
            _ => i += 1,
        }
    }
    ValidateArgs {
        sample,
        accept,
        annotator,
    }
}

pub(crate) fn has_flag(args: &[String], start: usize, names: &[&str]) -> bool {
    args.iter().skip(start).any(|a| names.contains(&a.as_str()))
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };
    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }
    let verbose = has_flag(&args, 2, &["--verbose", "-v"]);

    match cmd {
        "import" => {
            let parsed = parse_import_args(&args, 2);
            let Some(path) = parsed.path else {
                print_error("Error: import needs a dataset file.");
                print_help();
                return Ok(());
            };
            let session = Session::open(verbose).await?;
            dataset::run_import(&session, &path, parsed.gold).await
        }
        "run" => {
            let session = Session::open(verbose).await?;
            process::run_loop(&session).await
        }
        "status" => {
            let json = has_flag(&args, 2, &["--json"]);
            let session = Session::open(verbose).await?;
            process::show_status(&session, json).await
        }
        "report" => {
            let session = Session::open(verbose).await?;
            process::show_report(&session).await
        }
        "review" => {
            let session = Session::open(verbose).await?;
            review::show_next(&session).await
        }
        "validate" => {
            let parsed = parse_validate_args(&args, 2);
            let (Some(sample), Some(accept)) = (parsed.sample, parsed.accept) else {
                print_error("Error: validate needs --sample <id> and one of --accept / --reject.");
                return Ok(());
            };
            let session = Session::open(verbose).await?;
            review::record_decision(&session, &sample, accept, &parsed.annotator).await
        }
        other => {
            print_error(&format!("Unknown command '{}'.", other));
            print_help();
            Ok(())
        }
    }
}
