//! CLI entry point for `dmarc-harvest`.

use std::path::PathBuf;
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use dmarc_harvest::config::{self, Config};
use dmarc_harvest::export::sink::RunOutput;
use dmarc_harvest::mailbox::imap::ImapClient;
use dmarc_harvest::model::position::MailboxPosition;
use dmarc_harvest::model::report::ExtractedReport;
use dmarc_harvest::pipeline::coordinator::{Coordinator, RunReport};
use dmarc_harvest::store::cursor::{CursorRecord, CursorStore, JsonCursorStore, MemoryCursorStore};

#[derive(Parser)]
#[command(
    name = "dmarc-harvest",
    version,
    about = "Harvest DMARC aggregate reports from an IMAP mailbox"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to $DMARC_HARVEST_CONFIG or the user config dir)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Fetch and decode but leave the stored cursor untouched
    #[arg(long, global = true)]
    dry_run: bool,

    /// IMAP password, overriding the config file
    #[arg(long, env = "DMARC_HARVEST_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new messages and extract their reports (default)
    Run,
    /// Inspect or change the stored cursor
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

#[derive(Subcommand)]
enum CursorAction {
    /// Show the stored cursor for the configured mailbox
    Show,
    /// Overwrite the stored cursor
    Reset {
        /// Position to store
        #[arg(long, default_value_t = 1)]
        position: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(cli.config.as_deref())?;
    if let Some(password) = cli.password.clone() {
        config.imap.password = password;
    }

    // RUST_LOG wins over -v, which wins over the config file.
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        None | Some(Commands::Run) => cmd_run(&config, cli.json, cli.dry_run).await,
        Some(Commands::Cursor { action }) => cmd_cursor(&config, action, cli.json),
        Some(Commands::Completions { shell }) => cmd_completions(shell),
        Some(Commands::Manpage) => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = if config.general.log_datetime {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .without_time()
            .with_writer(std::io::stderr)
            .boxed()
    };

    // Try to set up file logging
    let log_dir = config::log_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "dmarc-harvest.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Run one harvest against the configured mailbox.
async fn cmd_run(config: &Config, json: bool, dry_run: bool) -> anyhow::Result<()> {
    config.validate()?;

    let durable = JsonCursorStore::new(config::cursor_file_path(config));
    let mailbox_id = config.imap.mailbox_id();
    let mut store: Box<dyn CursorStore> = if dry_run {
        let current = durable.read_cursor(&mailbox_id)?;
        Box::new(MemoryCursorStore::seeded(&mailbox_id, current))
    } else {
        Box::new(durable)
    };

    let dir = config.output.dir.as_deref().filter(|_| !dry_run);
    let mut output = RunOutput::new(json, dir)?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Harvesting [{bar:40.cyan/blue}] {pos}/{len}")?
            .progress_chars("#>-"),
    );
    let progress = pb.clone();

    let start = Instant::now();
    let report = Coordinator::from_config(config, &mut *store, &mut output)
        .with_progress(move |done, total| {
            progress.set_length(total);
            progress.set_position(done);
        })
        .run(ImapClient::connect(&config.imap))
        .await;
    pb.finish_and_clear();
    let elapsed = start.elapsed();

    if json {
        print_run_json(&mailbox_id, &report, &output.into_collected(), dry_run)?;
    } else {
        print_run_table(&mailbox_id, &report, elapsed, dry_run);
    }

    match report.error {
        Some(e) => anyhow::bail!("run failed: {e}"),
        None => Ok(()),
    }
}

fn print_run_table(mailbox_id: &str, report: &RunReport, elapsed: std::time::Duration, dry_run: bool) {
    for outcome in &report.outcomes {
        println!("Message {}: Success: {}", outcome.position, outcome.is_success());
        for e in &outcome.errors {
            println!("    {e}");
        }
    }

    let summary = &report.summary;
    println!();
    println!("  {:<25} {}", "Mailbox:", mailbox_id);
    if let Some(snapshot) = &report.snapshot {
        println!("  {:<25} {}", "Messages in mailbox:", snapshot.total_messages);
    }
    match report.range {
        Some(range) => println!("  {:<25} {}", "Fetched range:", range),
        None => println!("  {:<25} nothing new", "Fetched range:"),
    }
    println!("  {:<25} {}", "Messages processed:", summary.messages);
    println!("  {:<25} {}", "With reports:", summary.with_reports);
    println!("  {:<25} {}", "Without attachments:", summary.without_attachments);
    println!("  {:<25} {}", "Failed:", summary.failed);
    println!(
        "  {:<25} {}/{}",
        "Attachments decoded:", summary.attachments_parsed, summary.attachments_found
    );
    println!(
        "  {:<25} {} → {}{}",
        "Cursor:",
        display_cursor(report.cursor_before),
        display_cursor(report.cursor_after),
        if dry_run { " (dry run, not stored)" } else { "" }
    );
    println!("  {:<25} {:.2?}", "Elapsed:", elapsed);
    if let Some(e) = &report.logout_error {
        println!("  {:<25} {e}", "Logout:");
    }
    if let Some(e) = &report.error {
        println!("  {:<25} {e}", "Error:");
    }
}

fn print_run_json(
    mailbox_id: &str,
    report: &RunReport,
    reports: &[ExtractedReport],
    dry_run: bool,
) -> anyhow::Result<()> {
    let messages: Vec<serde_json::Value> = report
        .outcomes
        .iter()
        .map(|o| {
            serde_json::json!({
                "position": o.position,
                "success": o.is_success(),
                "attachments_found": o.attachments_found,
                "attachments_parsed": o.attachments_parsed,
                "errors": o.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            })
        })
        .collect();

    let out = serde_json::json!({
        "mailbox": mailbox_id,
        "success": report.is_success(),
        "state": report.final_state(),
        "dry_run": dry_run,
        "total_messages": report.snapshot.map(|s| s.total_messages),
        "range": report.range.map(|r| [r.from(), r.to()]),
        "cursor_before": report.cursor_before,
        "cursor_after": report.cursor_after,
        "summary": report.summary,
        "messages": messages,
        "reports": reports,
        "error": report.error.as_ref().map(ToString::to_string),
        "logout_error": report.logout_error.as_ref().map(ToString::to_string),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn display_cursor(position: Option<MailboxPosition>) -> String {
    position.map_or_else(|| "-".to_string(), |p| p.to_string())
}

/// Show or overwrite the stored cursor.
fn cmd_cursor(config: &Config, action: CursorAction, json: bool) -> anyhow::Result<()> {
    let mut store = JsonCursorStore::new(config::cursor_file_path(config));
    let mailbox_id = config.imap.mailbox_id();

    match action {
        CursorAction::Show => {
            let record = store.read_cursor(&mailbox_id)?;
            if json {
                let out = serde_json::json!({
                    "mailbox": mailbox_id,
                    "path": store.path().to_string_lossy(),
                    "cursor": record,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }
            println!("  {:<25} {}", "Mailbox:", mailbox_id);
            println!("  {:<25} {}", "Cursor file:", store.path().display());
            match record {
                Some(record) => {
                    println!("  {:<25} {}", "Position:", record.position);
                    if let Some(validity) = record.uid_validity {
                        println!("  {:<25} {}", "UIDVALIDITY:", validity);
                    }
                    println!("  {:<25} {}", "Updated:", record.updated_at.to_rfc3339());
                }
                None => println!("  {:<25} none (next run starts at 1)", "Position:"),
            }
        }
        CursorAction::Reset { position } => {
            if position == 0 {
                anyhow::bail!("positions start at 1");
            }
            let record = CursorRecord::new(MailboxPosition(position), None);
            store.write_cursor(&mailbox_id, record)?;
            println!("Cursor for {mailbox_id} set to {position}");
        }
    }
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "dmarc-harvest", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}
