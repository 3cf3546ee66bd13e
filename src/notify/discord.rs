use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use poise::serenity_prelude as serenity;

use super::Subscriber;
use crate::store::types::Finding;

/// Posts each finding to a Discord channel.
pub struct DiscordSubscriber {
    http: Arc<serenity::Http>,
    channel: serenity::ChannelId,
}

impl DiscordSubscriber {
    pub fn new(http: Arc<serenity::Http>, channel_id: u64) -> Self {
        Self {
            http,
            channel: serenity::ChannelId::new(channel_id),
        }
    }
}

#[async_trait]
impl Subscriber for DiscordSubscriber {
    fn name(&self) -> &str {
        "discord"
    }

    async fn notify(&self, finding: &Finding) -> anyhow::Result<()> {
        self.channel
            .say(self.http.as_ref(), render(finding))
            .await
            .context("failed to post finding to Discord")?;
        Ok(())
    }
}

/// Message body, kept under Discord's 2000 char limit.
pub fn render(finding: &Finding) -> String {
    let mut text = format!(
        "**{}**\nSignificance: **{:.2}** | Source: {}\n",
        finding.title, finding.significance, finding.source_ref
    );
    if !finding.matched_keywords.is_empty() {
        let keywords: Vec<&str> = finding.matched_keywords.iter().map(String::as_str).collect();
        text.push_str(&format!("Keywords: {}\n", keywords.join(", ")));
    }
    text.push_str(&format!("\n{}", finding.summary));
    text.chars().take(1990).collect()
}
