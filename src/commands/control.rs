use super::{clip, require_admin, send_chunked};
use crate::scheduler::CheckState;
use crate::state::Context;

/// Show scheduler status and per-target health
#[poise::command(slash_command, guild_only)]
pub async fn status(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let status = ctx.data().monitor.status().await;

    let mut output = format!(
        "**Monitoring:** {}\n**Targets:** {} | **Due:** {} | **Checking:** {}\n",
        if status.running { "running" } else { "stopped" },
        status.target_count,
        status.due_count,
        status.in_flight
    );
    if let Some(at) = status.last_tick_at {
        output.push_str(&format!("**Last tick:** <t:{}:R>\n", at.timestamp()));
    }
    output.push('\n');

    for t in &status.targets {
        let state = match t.state {
            CheckState::Idle => "idle",
            CheckState::Due => "due",
            CheckState::Checking => "checking",
            CheckState::Backoff => "backoff",
        };
        output.push_str(&format!(
            "- **{}** `{}`: {} (every {:.1}h",
            clip(&t.target, 60),
            &t.id[..8.min(t.id.len())],
            state,
            t.effective_interval_hours
        ));
        if t.consecutive_failures > 0 {
            output.push_str(&format!(
                ", {} failures, backoff x{}",
                t.consecutive_failures, t.backoff_multiplier
            ));
        }
        output.push(')');
        if let Some(next) = t.next_check_at {
            output.push_str(&format!(" next <t:{}:R>", next.timestamp()));
        }
        if let Some(err) = &t.last_error {
            output.push_str(&format!("\n  last error: {}", clip(err, 150)));
        }
        output.push('\n');
    }

    send_chunked(&ctx, &output).await
}

/// Start the monitoring loop (admin only)
#[poise::command(slash_command, guild_only)]
pub async fn start(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    if !require_admin(&ctx).await? {
        return Ok(());
    }
    if ctx.data().monitor.start_monitoring().await {
        ctx.say("Monitoring started.").await?;
    } else {
        ctx.say("Monitoring is already running.").await?;
    }
    Ok(())
}

/// Stop the monitoring loop (admin only)
#[poise::command(slash_command, guild_only)]
pub async fn stop(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    if !require_admin(&ctx).await? {
        return Ok(());
    }
    ctx.defer().await?;
    if ctx.data().monitor.stop_monitoring().await {
        ctx.say("Monitoring stopped.").await?;
    } else {
        ctx.say("Monitoring was not running.").await?;
    }
    Ok(())
}
