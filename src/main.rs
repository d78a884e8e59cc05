use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;

use reclaim_orchestrator::logging::{init_logging, LogLevel};
use reclaim_orchestrator::matching::{
    convert_template_to_regex, extract_parameters, matches_request_criteria, matches_response,
    separate_parameters,
};
use reclaim_orchestrator::provider::{CapturedRequest, CapturedResponse, ProviderData};

#[derive(Parser)]
#[command(
    name = "reclaim-orchestrator",
    version,
    about = "Inspect provider templates and test them against captured traffic"
)]
struct Cli {
    /// error, warn, info, debug or trace.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a `{{placeholder}}` template and print its regex.
    Template {
        template: String,
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Run every template of a provider descriptor against one capture.
    Match {
        #[arg(long)]
        provider: PathBuf,
        #[arg(long)]
        capture: PathBuf,
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
}

#[derive(Deserialize)]
struct Capture {
    request: CapturedRequest,
    #[serde(default)]
    response: Option<CapturedResponse>,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got {raw:?}")),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.log_level.parse().unwrap_or(LogLevel::Warn));

    match cli.command {
        Command::Template { template, params } => {
            let params: BTreeMap<String, String> = params.into_iter().collect();
            let compiled = convert_template_to_regex(&template, &params)?;
            let report = json!({
                "pattern": compiled.pattern(),
                "variables": compiled.variables(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Match {
            provider,
            capture,
            params,
        } => {
            let params: BTreeMap<String, String> = params.into_iter().collect();
            let provider: ProviderData = serde_json::from_str(&fs::read_to_string(provider)?)?;
            let capture: Capture = serde_json::from_str(&fs::read_to_string(capture)?)?;

            let mut results = Vec::new();
            for template in &provider.request_data {
                let request_ok = matches_request_criteria(&capture.request, template, &params);
                let response_ok = capture
                    .response
                    .as_ref()
                    .map_or(true, |response| matches_response(response, template, &params));
                let mut entry = json!({
                    "requestHash": template.request_hash,
                    "matched": request_ok && response_ok,
                });
                if request_ok && response_ok {
                    let values =
                        extract_parameters(template, &capture.request, capture.response.as_ref(), &params);
                    let separated = separate_parameters(&values);
                    entry["publicParameters"] = json!(separated.public);
                    entry["secretParameters"] = json!(separated.secret.keys().collect::<Vec<_>>());
                }
                results.push(entry);
            }
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    Ok(())
}
