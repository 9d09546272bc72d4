mod api;
mod bhl;
mod detect;
mod illustrations;
mod metadata;
mod sdc;
mod store;
mod wikidata;
mod wikitext;

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};

const DEFAULT_MATCHED: &str = "biodivlibrary_results.yaml";
const DEFAULT_UNMATCHED: &str = "non_bhl_results.yaml";

#[derive(Parser)]
#[command(
    name = "bhl_reconciler",
    about = "Reconcile Commons file metadata against the Biodiversity Heritage Library"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search Commons for BHL-derived files and classify them
    Detect {
        /// Store for files matching a BHL provenance marker
        #[arg(long, default_value = DEFAULT_MATCHED)]
        matched: PathBuf,
        /// Store for false positives
        #[arg(long, default_value = DEFAULT_UNMATCHED)]
        unmatched: PathBuf,
        /// Max result pages to fetch (default: all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Add the attribution template to detected files
    Tag {
        /// Detect store to read titles from
        #[arg(long, default_value = DEFAULT_MATCHED)]
        input: PathBuf,
        /// Apply edits (default: dry run)
        #[arg(long)]
        write: bool,
    },
    /// Build the per-category metadata worksheet
    Metadata {
        /// Commons category (with or without the Category: prefix)
        category: String,
        /// Collection when the bibliography page scrape comes up empty
        #[arg(long)]
        collection: Option<String>,
        /// Sponsor when the bibliography page scrape comes up empty
        #[arg(long)]
        sponsor: Option<String>,
        /// Illustrator QID to record on every row
        #[arg(long)]
        illustrator: Option<String>,
        /// Output path (default: <category>.tsv)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Build SDC statements from a worksheet and upload them
    Upload {
        worksheet: PathBuf,
        /// Apply edits (default: dry run, print claims only)
        #[arg(long)]
        write: bool,
        #[arg(long)]
        skip_published_in: bool,
        /// Write P31 from the worksheet instead of gating on existing claims
        #[arg(long)]
        plain_instance_of: bool,
        /// Leave the sponsor statement out when the row has none
        #[arg(long)]
        no_empty_sponsor: bool,
    },
    /// Sweep a botanical-illustration category tree into QuickStatements
    Illustrations {
        /// Root Commons category holding the genus subcategories
        category: String,
        /// Directory for the statement and log files
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Show classification statistics for the detect stores
    Stats {
        #[arg(long, default_value = DEFAULT_MATCHED)]
        matched: PathBuf,
        #[arg(long, default_value = DEFAULT_UNMATCHED)]
        unmatched: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Detect {
            matched,
            unmatched,
            limit,
        } => {
            let client = api::Client::new()?;
            let mut source = detect::CommonsSearch::new(client);
            let stores = detect::DetectStores {
                matched_path: matched,
                unmatched_path: unmatched,
            };
            let summary = detect::run(&mut source, &stores, limit).await?;
            println!("\nProcessing complete.");
            println!("- BHL matches found: {}", summary.matched);
            println!("- Non-BHL (false positives): {}", summary.unmatched);
            println!("- Files processed this run: {}", summary.processed);
            println!("- Result pages fetched: {}", summary.pages);
            Ok(())
        }
        Commands::Tag { input, write } => {
            let records = store::load_records(&input)?;
            if records.is_empty() {
                println!(
                    "No detected files in {}. Run 'detect' first.",
                    input.display()
                );
                return Ok(());
            }
            println!("Tagging {} files...", records.len());
            let client = api::Client::new()?;
            let summary = wikitext::tag_files(&client, &records, write).await?;
            println!(
                "Done: {} tagged, {} already tagged, {} errors.",
                summary.tagged, summary.already_tagged, summary.failed
            );
            Ok(())
        }
        Commands::Metadata {
            category,
            collection,
            sponsor,
            illustrator,
            output,
        } => {
            let category = metadata::normalize_category(&category);
            let client = api::Client::new()?;
            let overrides = metadata::Overrides {
                collection,
                sponsor,
                illustrator,
            };
            let rows = metadata::build(&client, &category, &overrides).await?;
            if rows.is_empty() {
                println!("No files found in Category:{}.", category);
                return Ok(());
            }
            let output = output.unwrap_or_else(|| {
                PathBuf::from(format!("{}.tsv", category.replace(' ', "_")))
            });
            store::write_worksheet(&output, &rows)?;
            println!("Data written to: {}", output.display());
            Ok(())
        }
        Commands::Upload {
            worksheet,
            write,
            skip_published_in,
            plain_instance_of,
            no_empty_sponsor,
        } => {
            let rows = store::read_worksheet(&worksheet)?;
            if rows.is_empty() {
                println!("No rows in {}.", worksheet.display());
                return Ok(());
            }
            println!("Processing {} rows...", rows.len());
            let client = api::Client::new()?;
            let opts = sdc::UploadOptions {
                write,
                skip_published_in,
                plain_instance_of,
                no_empty_sponsor,
            };
            let summary = sdc::upload_rows(&client, &rows, &opts).await?;
            println!(
                "Done: {} edited, {} skipped, {} errors.",
                summary.edited, summary.skipped, summary.failed
            );
            Ok(())
        }
        Commands::Illustrations { category, out_dir } => {
            let category = metadata::normalize_category(&category);
            println!("Processing category: {}", category);
            let client = api::Client::new()?;
            let outputs = illustrations::run(&client, &category).await?;
            std::fs::create_dir_all(&out_dir)?;
            outputs.write_to(&out_dir)?;
            println!(
                "Processing complete: {} depicts statements, {} P18, {} single-file refs, \
                 {} two-file refs, {} for manual review.",
                outputs.commons_statements.len(),
                outputs.p18_statements.len(),
                outputs.reference_single.len(),
                outputs.reference_double.len(),
                outputs.manual_log.len()
            );
            println!("Outputs saved to {}", out_dir.display());
            Ok(())
        }
        Commands::Stats { matched, unmatched } => {
            let matched = store::load_records(&matched)?;
            let unmatched = store::load_records(&unmatched)?;
            println!("Matched:   {}", matched.len());
            println!("Unmatched: {}", unmatched.len());
            println!("Total:     {}", matched.len() + unmatched.len());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
