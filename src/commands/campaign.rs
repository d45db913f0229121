use anyhow::{Context, Result};
use std::path::Path;
use uuid::Uuid;

use thumbwheel::app::App;
use thumbwheel::models::NewCampaign;
use thumbwheel::utils::truncate_text;

/// Create a campaign from a JSON definition
pub async fn add_campaign(app: &App, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read campaign file: {}", file.display()))?;

    let input: NewCampaign = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse campaign file: {}", file.display()))?;

    let campaign = input.into_campaign().context("Invalid campaign")?;
    app.campaigns
        .insert_campaign(&campaign)
        .await
        .context("Failed to store campaign")?;

    tracing::info!(campaign_id = %campaign.id, target = %campaign.target_resource, "Campaign created");

    println!("Created campaign {}", campaign.id);
    println!("  Target: {}", campaign.target_resource);
    println!("  Variants: {}", campaign.variants.len());
    println!("  Window: {} .. {}", campaign.window_start, campaign.window_end);
    println!("  Cadence: every {}", campaign.cadence);
    Ok(())
}

/// Print one campaign with its rotation log and performance records
pub async fn show_campaign(app: &App, id: Uuid) -> Result<()> {
    let campaign = app
        .campaigns
        .get_campaign(id)
        .await?
        .with_context(|| format!("Campaign not found: {id}"))?;

    let log = app.campaigns.rotation_log(id).await?;
    let performance = app.performance.performance_for(id).await?;

    println!("{}", serde_json::to_string_pretty(&campaign)?);
    if let Some(live) = campaign.current_variant() {
        println!("Live variant: #{} {}", campaign.current_index, truncate_text(live, 48));
    }

    println!();
    println!("Rotation log ({} entries)", log.len());
    println!("{:-<60}", "");
    for entry in &log {
        println!(
            "{}  #{}  {}",
            entry.published_at,
            entry.variant_index,
            truncate_text(&entry.variant_locator, 48)
        );
    }

    if !performance.is_empty() {
        println!();
        println!("Performance");
        println!("{:-<60}", "");
        for record in &performance {
            println!(
                "{:<48}  views={} likes={}",
                truncate_text(&record.variant_locator, 48),
                record.metrics.views,
                record.metrics.likes
            );
        }
    }

    Ok(())
}

/// List all campaigns
pub async fn list_campaigns(app: &App) -> Result<()> {
    let campaigns = app.campaigns.list_campaigns().await?;

    if campaigns.is_empty() {
        println!("No campaigns");
        return Ok(());
    }

    println!(
        "{:<36}  {:<14}  {:>5}  {:<25}  {}",
        "ID", "TARGET", "IDX", "NEXT DUE", "STATE"
    );
    for c in &campaigns {
        let state = if c.finalized {
            "finalized"
        } else if app.driver.state().is_cancelled(c.id) {
            "cancelled"
        } else {
            "active"
        };
        println!(
            "{:<36}  {:<14}  {:>2}/{:<2}  {:<25}  {}",
            c.id,
            truncate_text(&c.target_resource, 14),
            c.current_index,
            c.variants.len(),
            c.next_due_at.to_rfc3339(),
            state
        );
    }
    Ok(())
}

/// Store an owner's OAuth refresh token
pub async fn set_refresh_token(app: &App, owner: &str, refresh_token: &str) -> Result<()> {
    if refresh_token.trim().is_empty() {
        anyhow::bail!("Refresh token must not be empty");
    }

    app.tokens
        .set_refresh_token(owner, refresh_token)
        .await
        .context("Failed to store refresh token")?;

    if !app.config.platform.oauth_enabled() {
        eprintln!("Warning: GOOGLE_CLIENT_ID/GOOGLE_CLIENT_SECRET are not set; the token will not be used");
    }

    println!("Stored refresh token for {owner}");
    Ok(())
}
