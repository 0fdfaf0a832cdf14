use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tokmon_core::models::TokenUsage;
use tokmon_core::pricing::{CostCalculator, PricingTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn cmd_pricing(format: OutputFormat) -> Result<()> {
    let pricing = PricingTable::default_table();

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&pricing)?);
        return Ok(());
    }

    println!("{}", "Model Pricing".cyan().bold());
    println!("{}", "═".repeat(60).dimmed());
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Model").fg(comfy_table::Color::Cyan),
            Cell::new("Prompt $").fg(comfy_table::Color::Cyan),
            Cell::new("Completion $").fg(comfy_table::Color::Cyan),
            Cell::new("Per Tokens").fg(comfy_table::Color::Cyan),
        ]);

    for (model, entry) in pricing.iter() {
        table.add_row(vec![
            Cell::new(model),
            Cell::new(format!("${:.6}", entry.prompt_cost)),
            Cell::new(format!("${:.6}", entry.completion_cost)),
            Cell::new(entry.per_tokens),
        ]);
    }

    println!("{}", table);
    println!();
    println!("  Total: {} models", pricing.len());

    Ok(())
}

pub fn cmd_cost(model: &str, prompt: u64, completion: u64, format: OutputFormat) -> Result<()> {
    let calculator = CostCalculator::default();
    let usage = TokenUsage::new(prompt, completion);
    let breakdown = calculator.calculate(model, &usage)?;

    if format == OutputFormat::Json {
        let output = serde_json::json!({
            "model": model,
            "usage": usage,
            "cost": breakdown,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{} {}", "Cost for".cyan().bold(), model.yellow());
    println!("{}", "═".repeat(40).dimmed());
    println!(
        "  {:<12} {:>10} tokens  ${:.6}",
        "Prompt:".bold(),
        usage.prompt_tokens,
        breakdown.prompt_cost
    );
    println!(
        "  {:<12} {:>10} tokens  ${:.6}",
        "Completion:".bold(),
        usage.completion_tokens,
        breakdown.completion_cost
    );
    println!("{}", "─".repeat(40).dimmed());
    println!(
        "  {:<12} {:>10} tokens  {}",
        "Total:".bold(),
        usage.total_tokens,
        format!("${}", breakdown.display_total()).green().bold()
    );

    Ok(())
}
