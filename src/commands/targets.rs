use std::collections::BTreeSet;

use tracing::info;

use super::{clip, require_admin, send_chunked};
use crate::error::MonitorError;
use crate::state::Context;
use crate::targets::types::{MonitoringType, Priority};

/// Add a monitoring target (admin only)
#[poise::command(slash_command, guild_only)]
pub async fn add(
    ctx: Context<'_>,
    #[description = "URL, keyword, topic or feed query"] target: String,
    #[description = "url | keyword | topic | arxiv | news"] kind: String,
    #[description = "Hours between checks (default 24)"] frequency_hours: Option<f64>,
    #[description = "low | medium | high | critical (default medium)"] priority: Option<String>,
    #[description = "Comma-separated keywords"] keywords: Option<String>,
    #[description = "Minimum significance to notify, 0-1 (default 0.3)"] threshold: Option<f64>,
) -> Result<(), anyhow::Error> {
    if !require_admin(&ctx).await? {
        return Ok(());
    }

    let parsed = kind.parse::<MonitoringType>().and_then(|kind| {
        let priority = priority
            .as_deref()
            .map(str::parse::<Priority>)
            .transpose()?
            .unwrap_or_default();
        Ok((kind, priority))
    });
    let (kind, priority) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            ctx.say(format!("Invalid target: {}", e)).await?;
            return Ok(());
        }
    };
    let keywords: BTreeSet<String> = keywords
        .unwrap_or_default()
        .split(',')
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();

    let result = ctx
        .data()
        .monitor
        .add_target(
            &target,
            kind,
            frequency_hours.unwrap_or(24.0),
            priority,
            keywords,
            threshold.unwrap_or(0.3),
        )
        .await;

    match result {
        Ok(id) => {
            info!(user = ctx.author().name, target_id = %id, "target added via command");
            ctx.say(format!(
                "Now watching **{}** ({}, {} priority). Id: `{}`",
                target, kind, priority, id
            ))
            .await?;
        }
        Err(MonitorError::Validation(e)) => {
            ctx.say(format!("Invalid target: {}", e)).await?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Stop watching a target (admin only)
#[poise::command(slash_command, guild_only)]
pub async fn remove(
    ctx: Context<'_>,
    #[description = "Target id (see /watch list)"] id: String,
) -> Result<(), anyhow::Error> {
    if !require_admin(&ctx).await? {
        return Ok(());
    }

    if ctx.data().monitor.remove_target(id.trim()).await? {
        ctx.say(format!("Removed target `{}`.", id.trim())).await?;
    } else {
        ctx.say(format!("No target with id `{}`.", id.trim())).await?;
    }
    Ok(())
}

/// List monitored targets
#[poise::command(slash_command, guild_only)]
pub async fn list(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let targets = ctx.data().monitor.list_targets().await;

    if targets.is_empty() {
        ctx.say("No targets yet. Use `/watch add` to start monitoring something.")
            .await?;
        return Ok(());
    }

    let mut output = format!("**Monitored Targets ({})**\n\n", targets.len());
    for t in &targets {
        output.push_str(&format!(
            "- **{}** ({}, {}, every {}h, threshold {:.2})\n  `{}`",
            clip(&t.target, 80),
            t.monitoring_type,
            t.priority,
            t.frequency_hours,
            t.notification_threshold,
            t.id
        ));
        if !t.keywords.is_empty() {
            let keywords: Vec<&str> = t.keywords.iter().map(String::as_str).collect();
            output.push_str(&format!(" | keywords: {}", keywords.join(", ")));
        }
        match t.last_checked_at {
            Some(at) => output.push_str(&format!(" | last checked <t:{}:R>\n", at.timestamp())),
            None => output.push_str(" | never checked\n"),
        }
    }

    send_chunked(&ctx, &output).await
}
