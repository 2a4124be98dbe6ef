//! `mxprobe` - command-line mailbox deliverability prober.
//!
//! Resolves mail exchangers, probes addresses with `RCPT TO` and prints one
//! result per address.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod args;

use std::io::{self, BufRead};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use mxprobe_core::{
    BatchResult, DomainResolution, DomainResolver, HickoryLookup, ProbeConfig, ProbeResult, Prober,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use args::{Cli, Commands, Format};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mxprobe=info,mxprobe_core=info,mxprobe_smtp=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ProbeConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => ProbeConfig::default(),
    };

    match cli.cmd {
        Commands::Probe {
            emails,
            file,
            stdin,
        } => {
            let emails = collect_emails(emails, file.as_deref(), stdin)?;
            if emails.is_empty() {
                bail!("no addresses given; pass them as arguments, with --file or with --stdin");
            }
            probe(config, &emails, cli.format).await
        }
        Commands::Resolve { domain } => resolve(&config, &domain, cli.format).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Addresses from arguments, then the file, then stdin. Blank lines and
/// `#` comments are skipped.
fn collect_emails(mut emails: Vec<String>, file: Option<&Path>, stdin: bool) -> Result<Vec<String>> {
    if let Some(path) = file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        emails.extend(content.lines().filter_map(address_line));
    }
    if stdin {
        for line in io::stdin().lock().lines() {
            if let Some(email) = address_line(&line?) {
                emails.push(email);
            }
        }
    }
    Ok(emails)
}

fn address_line(line: &str) -> Option<String> {
    let line = line.trim();
    (!line.is_empty() && !line.starts_with('#')).then(|| line.to_string())
}

async fn probe(config: ProbeConfig, emails: &[String], format: Format) -> Result<()> {
    let prober = Prober::from_config(config)?;
    prober.start_maintenance();
    info!(addresses = emails.len(), "probing");

    if let [email] = emails {
        let result = prober.probe_email(email).await;
        match format {
            Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            Format::Human => println!("{}", human_line(&result)),
        }
    } else {
        let batch = prober.probe_batch(emails).await;
        match format {
            Format::Json => println!("{}", serde_json::to_string_pretty(&batch)?),
            Format::Human => print_batch(&batch),
        }
    }

    prober.shutdown().await;
    Ok(())
}

fn human_line(result: &ProbeResult) -> String {
    let code = result
        .response_code
        .map_or_else(|| "-".to_string(), |code| code.to_string());
    let detail = result
        .error
        .as_deref()
        .or(result.response_message.as_deref())
        .unwrap_or_default();
    let verdict = result.verdict_score();
    format!(
        "{}\t{}\t{} {}\t{}\t{}\t{}",
        result.email,
        result.status,
        verdict.verdict,
        verdict.score,
        code,
        result.mx_host.as_deref().unwrap_or("-"),
        detail
    )
}

fn print_batch(batch: &BatchResult) {
    for result in &batch.results {
        println!("{}", human_line(result));
    }
    println!(
        "# {} processed: {} valid, {} invalid, {} catch-all, {} other in {} ms",
        batch.total_processed,
        batch.total_valid,
        batch.total_invalid,
        batch.total_catch_all,
        batch.total_errors,
        batch.total_time_ms
    );
}

async fn resolve(config: &ProbeConfig, domain: &str, format: Format) -> Result<()> {
    let lookup = HickoryLookup::from_system_conf(Duration::from_secs(config.dns.timeout_secs))?;
    let resolver = DomainResolver::new(Arc::new(lookup), config.cache.backend.build());
    let resolution = resolver.resolve_domain(domain).await;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&resolution)?),
        Format::Human => print_resolution(&resolution),
    }
    Ok(())
}

fn print_resolution(resolution: &DomainResolution) {
    println!("{} ({} ms)", resolution.domain, resolution.resolution_time_ms);
    for mx in &resolution.mx_records {
        println!("  MX   {:>5} {}", mx.priority, mx.exchange);
    }
    for ip in &resolution.a_records {
        println!("  A    {ip}");
    }
    for ip in &resolution.aaaa_records {
        println!("  AAAA {ip}");
    }
    for txt in &resolution.txt_records {
        println!("  TXT  {txt}");
    }
    if let Some(error) = &resolution.error {
        println!("  error: {error}");
    }
}
