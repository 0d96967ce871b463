use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use whiteout_contracts::estimate::CostEstimate;
use whiteout_engine::{
    format_currency, ingest_image, CostEstimator, DesignGateway, DesignStudio, DryrunTransport,
};

#[derive(Debug, Parser)]
#[command(name = "whiteout-rs", version, about = "Whiteout AI interior design studio")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a photorealistic redesign of a room photo.
    Render(RenderArgs),
    /// Apply a natural-language adjustment to a previous render.
    Adjust(AdjustArgs),
    /// Produce an itemized budget/premium cost comparison for an image.
    Estimate(EstimateArgs),
    /// Produce a cost estimate and export the annotated PDF report.
    Report(ReportArgs),
}

#[derive(Debug, Parser)]
struct RenderArgs {
    /// Base room photo (PNG, JPEG, or WEBP).
    #[arg(long)]
    image: PathBuf,
    /// Optional style reference photo; used for lighting, materials, and
    /// palette only.
    #[arg(long)]
    reference: Option<PathBuf>,
    /// Session directory for artifacts, receipts, and events.
    #[arg(long)]
    out: PathBuf,
    /// Use the offline backend double instead of the live API.
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct AdjustArgs {
    /// A previously saved render to adjust.
    #[arg(long)]
    image: PathBuf,
    /// What to change, e.g. "Change the sofa to blue".
    #[arg(long)]
    instruction: String,
    /// Optional visual support image for the adjustment.
    #[arg(long)]
    support: Option<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct EstimateArgs {
    /// Interior photo to analyze.
    #[arg(long)]
    image: PathBuf,
    /// Tier overrides as item=option pairs, e.g. `--select 1=1` for the
    /// premium option of item 1.
    #[arg(long)]
    select: Vec<String>,
    /// Print the estimate as JSON instead of a table.
    #[arg(long)]
    json: bool,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct ReportArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    select: Vec<String>,
    /// Report path; defaults to WhiteoutAI_Cost_Estimate.pdf in the session
    /// directory.
    #[arg(long)]
    pdf: Option<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    dryrun: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("whiteout-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Render(args) => run_render(args),
        Command::Adjust(args) => run_adjust(args),
        Command::Estimate(args) => run_estimate(args),
        Command::Report(args) => run_report(args),
    }
}

fn build_gateway(dryrun: bool) -> Result<DesignGateway> {
    if dryrun {
        return Ok(DesignGateway::with_transport(Box::new(
            DryrunTransport::new(),
        )));
    }
    Ok(DesignGateway::from_env()?)
}

fn run_render(args: RenderArgs) -> Result<i32> {
    let gateway = build_gateway(args.dryrun)?;
    let mut studio = DesignStudio::new(gateway, &args.out)?;

    studio.set_base_image(ingest_image(&args.image)?);
    if let Some(reference) = args.reference.as_deref() {
        studio.set_reference_image(ingest_image(reference)?);
    }
    studio.generate()?;
    let download = studio.save_render(&args.out)?;
    studio.finish()?;

    println!("Render saved to {}", download.display());
    Ok(0)
}

fn run_adjust(args: AdjustArgs) -> Result<i32> {
    let gateway = build_gateway(args.dryrun)?;
    let mut studio = DesignStudio::new(gateway, &args.out)?;

    studio.set_generated_image(ingest_image(&args.image)?);
    if let Some(support) = args.support.as_deref() {
        studio.set_adjustment_image(ingest_image(support)?);
    }
    studio.adjust(&args.instruction)?;
    let download = studio.save_render(&args.out)?;
    studio.finish()?;

    println!("Adjusted render saved to {}", download.display());
    Ok(0)
}

fn run_estimate(args: EstimateArgs) -> Result<i32> {
    let gateway = build_gateway(args.dryrun)?;
    let mut estimator = CostEstimator::new(gateway, &args.out)?;

    estimator.set_image(ingest_image(&args.image)?);
    estimator.analyze()?;
    for raw in &args.select {
        let (item, option) = parse_selection(raw)?;
        estimator.select(item, option)?;
    }

    let estimate = estimator
        .estimate()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no estimate installed after analysis"))?;
    if args.json {
        print_estimate_json(&estimator, &estimate)?;
    } else {
        print_estimate_table(&estimator, &estimate);
    }
    estimator.finish()?;
    Ok(0)
}

fn run_report(args: ReportArgs) -> Result<i32> {
    let gateway = build_gateway(args.dryrun)?;
    let mut estimator = CostEstimator::new(gateway, &args.out)?;

    estimator.set_image(ingest_image(&args.image)?);
    estimator.analyze()?;
    for raw in &args.select {
        let (item, option) = parse_selection(raw)?;
        estimator.select(item, option)?;
    }
    let report = estimator.export_report(args.pdf.as_deref())?;
    estimator.finish()?;

    println!("Report saved to {}", report.display());
    Ok(0)
}

/// Parses one `item=option` tier override.
fn parse_selection(raw: &str) -> Result<(usize, usize)> {
    let Some((item, option)) = raw.split_once('=') else {
        bail!("--select expects item=option (e.g. 1=1), got '{raw}'");
    };
    let item: usize = item
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid item index in --select '{raw}'"))?;
    let option: usize = option
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid option index in --select '{raw}'"))?;
    Ok((item, option))
}

fn print_estimate_table(estimator: &CostEstimator, estimate: &CostEstimate) {
    println!("{:<24} {:<36} {:>12}", "Item", "Selected option", "Cost");
    for (index, item) in estimate.items.iter().enumerate() {
        let option = &item.options[estimator.selections().option_for(index)];
        println!(
            "{:<24} {:<36} {:>12}",
            item.label,
            option.name,
            format_currency(option.estimated_cost)
        );
        println!("    {} (supplier: {})", option.description, option.supplier);
    }
    println!(
        "{:<61} {:>12}",
        "Total estimated cost:",
        format_currency(estimator.total_cost())
    );
}

fn print_estimate_json(estimator: &CostEstimator, estimate: &CostEstimate) -> Result<()> {
    let selections: Vec<usize> = (0..estimate.len())
        .map(|index| estimator.selections().option_for(index))
        .collect();
    let payload = json!({
        "items": estimate.items,
        "selections": selections,
        "total": estimator.total_cost(),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_selection;

    #[test]
    fn selection_overrides_parse() {
        assert_eq!(parse_selection("1=1").unwrap(), (1, 1));
        assert_eq!(parse_selection(" 2 = 0 ").unwrap(), (2, 0));
        assert!(parse_selection("1").is_err());
        assert!(parse_selection("a=1").is_err());
        assert!(parse_selection("1=b").is_err());
    }
}
