//! One-shot tick and finalizer runs, for use from an external cron

use anyhow::{Context, Result};
use chrono::Utc;

use thumbwheel::app::App;
use thumbwheel::scheduler::driver::CampaignOutcome;

/// Run one rotation tick and print the report as JSON
pub async fn tick(app: &App, limit: Option<usize>) -> Result<()> {
    let report = app
        .driver
        .tick_with_limit(Utc::now(), limit)
        .await
        .context("Rotation tick failed")?;

    for result in &report.results {
        if let CampaignOutcome::Failed { kind, reason, .. } = &result.outcome {
            eprintln!("  {} failed ({kind}): {reason}", result.campaign_id);
        }
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Run the analytics finalizer once and print the report as JSON
pub async fn finalize(app: &App) -> Result<()> {
    if !app.driver.has_finalizer() {
        anyhow::bail!("The analytics finalizer is disabled in the configuration");
    }

    let report = app
        .driver
        .run_finalizer(Utc::now())
        .await
        .context("Finalizer run failed")?;

    if let Some(until) = report.cooldown_until {
        eprintln!("Analytics quota exhausted; suspended until {until}");
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
