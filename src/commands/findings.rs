use super::{clip, send_chunked};
use crate::state::Context;

/// Recent significant findings
#[poise::command(slash_command, guild_only)]
pub async fn findings(
    ctx: Context<'_>,
    #[description = "Look back this many hours (default 24)"] hours: Option<u32>,
    #[description = "Only this target id"] target: Option<String>,
    #[description = "Max findings to show (default 10)"] limit: Option<u32>,
) -> Result<(), anyhow::Error> {
    let hours = hours.unwrap_or(24);
    let limit = limit.unwrap_or(10) as usize;
    let monitor = &ctx.data().monitor;

    let findings = match target.as_deref().map(str::trim) {
        Some(id) => monitor.findings_by_target(id).await?,
        None => monitor.findings(hours).await?,
    };

    if findings.is_empty() {
        ctx.say("No significant findings.").await?;
        return Ok(());
    }

    let mut output = format!("**Findings ({} total)**\n\n", findings.len());
    for f in findings.iter().take(limit) {
        output.push_str(&format!(
            "**{}**\nScore {:.2} | <t:{}:R> | {}\n{}\n\n",
            clip(&f.title, 200),
            f.significance,
            f.timestamp.timestamp(),
            f.source_ref,
            clip(&f.summary, 400)
        ));
    }

    send_chunked(&ctx, &output).await
}

/// Research report over a time window
#[poise::command(slash_command, guild_only)]
pub async fn report(
    ctx: Context<'_>,
    #[description = "Window in hours (default 24)"] hours: Option<u32>,
) -> Result<(), anyhow::Error> {
    // Narration may take a while
    ctx.defer().await?;
    let report = ctx
        .data()
        .monitor
        .generate_report(hours.unwrap_or(24))
        .await?;
    send_chunked(&ctx, &report.render_markdown()).await
}
