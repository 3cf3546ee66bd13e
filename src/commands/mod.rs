mod control;
mod findings;
mod targets;

use crate::state::Context;

/// Research Watch - proactive research monitoring
#[poise::command(
    slash_command,
    subcommands(
        "targets::add",
        "targets::remove",
        "targets::list",
        "control::status",
        "control::start",
        "control::stop",
        "findings::findings",
        "findings::report"
    )
)]
pub async fn watch(_ctx: Context<'_>) -> Result<(), anyhow::Error> {
    Ok(())
}

/// Replies with a refusal and returns `false` for non-admins.
async fn require_admin(ctx: &Context<'_>) -> Result<bool, anyhow::Error> {
    if ctx.data().is_admin(ctx.author().id.get()) {
        return Ok(true);
    }
    ctx.say("This command is admin-only.").await?;
    Ok(false)
}

/// Send a message in Discord-safe chunks.
/// Uses ctx.say() for all chunks: poise routes follow-ups through the
/// interaction webhook, which doesn't require Send Messages channel permission.
async fn send_chunked(ctx: &Context<'_>, text: &str) -> Result<(), anyhow::Error> {
    for chunk in chunks(text, 1990) {
        ctx.say(chunk).await?;
    }
    Ok(())
}

/// Split on the last newline (or space) before `max_bytes`, never inside a char.
pub(crate) fn chunks(text: &str, max_bytes: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_bytes {
            out.push(remaining);
            break;
        }
        let mut limit = max_bytes;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let head = &remaining[..limit];
        let split_at = head
            .rfind('\n')
            .or_else(|| head.rfind(' '))
            .map(|i| i + 1)
            .unwrap_or(limit.max(first_char_len(remaining)));
        out.push(&remaining[..split_at]);
        remaining = &remaining[split_at..];
    }
    out
}

fn first_char_len(text: &str) -> usize {
    text.chars().next().map(char::len_utf8).unwrap_or(0)
}

/// First `max` chars of `text`, with an ellipsis when cut.
pub(crate) fn clip(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_prefer_newlines() {
        let text = "aaaa\nbbbb\ncccc";
        assert_eq!(chunks(text, 10), vec!["aaaa\nbbbb\n", "cccc"]);
    }

    #[test]
    fn test_chunks_respect_char_boundaries() {
        let text = "ééééé";
        let parts = chunks(text, 3);
        assert_eq!(parts.concat(), text);
        assert!(parts.iter().all(|p| p.len() <= 3));
    }

    #[test]
    fn test_short_text_single_chunk() {
        assert_eq!(chunks("hello", 1990), vec!["hello"]);
        assert!(chunks("", 1990).is_empty());
    }

    #[test]
    fn test_clip() {
        assert_eq!(clip("abcdef", 3), "abc…");
        assert_eq!(clip("abc", 3), "abc");
    }
}
