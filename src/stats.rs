use anyhow::Result;
use chrono::Utc;
use serenity::all::{Colour, CommandInteraction, Context, CreateEmbed, CreateEmbedFooter, UserId};

use crate::commands::{reply, reply_embed, resolved_user, str_option, user_id_option, CommandHandler};
use crate::voice::format_duration;

const LEADERBOARD_SIZE: i64 = 10;

/// One line per entry, medals for the podium.
pub fn ranking_lines<'a>(entries: impl IntoIterator<Item = (&'a str, String)>) -> String {
    entries
        .into_iter()
        .enumerate()
        .map(|(index, (name, value))| {
            let rank = match index {
                0 => "🥇".to_string(),
                1 => "🥈".to_string(),
                2 => "🥉".to_string(),
                n => format!("**{}.**", n + 1),
            };
            format!("{} {}: {}", rank, name, value)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl CommandHandler {
    /// Stored total plus the part of the current session not yet flushed.
    async fn voice_seconds(&self, user_id: UserId) -> Result<(i64, i64)> {
        let stored = self
            .db
            .get_user_voice_data(user_id)
            .await?
            .map_or(0, |row| row.total_time);
        let live = self
            .tracker
            .session(user_id)
            .map_or(0, |session| (Utc::now() - session.join_time).num_seconds().max(0));
        Ok((stored, live))
    }

    async fn voice_time_reply(&self, ctx: &Context, command: &CommandInteraction, user_id: UserId) -> Result<()> {
        let (stored, live) = self.voice_seconds(user_id).await?;
        let mut content = format!(
            "🎙️ <@{}> has spent **{}** in voice channels.",
            user_id,
            format_duration(stored + live)
        );
        if live > 0 {
            content.push_str(&format!(" (including {} in the current session)", format_duration(live)));
        }
        reply(ctx, command, content, true).await
    }

    async fn voice_top_embed(&self) -> Result<CreateEmbed> {
        let rows = self.db.get_top_voice_users(LEADERBOARD_SIZE).await?;
        let description = if rows.is_empty() {
            "Nobody has spent time in voice yet.".to_string()
        } else {
            ranking_lines(
                rows.iter()
                    .map(|row| (row.username.as_str(), format_duration(row.total_time))),
            )
        };

        Ok(CreateEmbed::new()
            .title("🎙️ Voice leaderboard")
            .description(description)
            .colour(Colour::BLUE))
    }

    pub(crate) async fn handle_voice(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        match str_option(command, "action") {
            Some("top") => {
                let embed = self.voice_top_embed().await?;
                reply_embed(ctx, command, embed, true).await
            }
            _ => {
                let user_id = user_id_option(command, "user").unwrap_or(command.user.id);
                self.voice_time_reply(ctx, command, user_id).await
            }
        }
    }

    pub(crate) async fn handle_voice_leaderboard(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        let embed = self.voice_top_embed().await?;
        reply_embed(ctx, command, embed, false).await
    }

    pub(crate) async fn handle_check_voice(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        self.voice_time_reply(ctx, command, command.user.id).await
    }

    pub(crate) async fn handle_message_stats(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        let user = resolved_user(command, "user").unwrap_or(&command.user);

        let total = self.db.get_total_messages(user.id).await?;
        let channels = self.db.get_top_channels(user.id, 3).await?;

        let mut embed = CreateEmbed::new()
            .title(format!("💬 Message stats of {}", user.name))
            .thumbnail(user.face())
            .colour(Colour::DARK_GREEN)
            .field("Total messages", total.to_string(), false);

        if !channels.is_empty() {
            let top = channels
                .iter()
                .map(|row| format!("<#{}>: {}", row.channel_id, row.message_count))
                .collect::<Vec<_>>()
                .join("\n");
            embed = embed.field("Most active channels", top, false);
        }

        reply_embed(ctx, command, embed, true).await
    }

    pub(crate) async fn handle_message_leaderboard(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        let rows = self.db.get_message_leaderboard(LEADERBOARD_SIZE).await?;
        let description = if rows.is_empty() {
            "No messages counted yet.".to_string()
        } else {
            ranking_lines(
                rows.iter()
                    .map(|row| (row.username.as_str(), format!("{} messages", row.total_messages))),
            )
        };

        let embed = CreateEmbed::new()
            .title("💬 Message leaderboard")
            .description(description)
            .colour(Colour::DARK_GREEN)
            .footer(CreateEmbedFooter::new("Counted across every channel"));

        reply_embed(ctx, command, embed, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranking_lines() {
        let rows = vec![
            ("alice", "3h 0m 0s".to_string()),
            ("bob", "2h 0m 0s".to_string()),
            ("carol", "1h 0m 0s".to_string()),
            ("dave", "0h 5m 0s".to_string()),
        ];

        let text = ranking_lines(rows);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "🥇 alice: 3h 0m 0s");
        assert_eq!(lines[3], "**4.** dave: 0h 5m 0s");
    }

    #[test]
    fn test_ranking_lines_empty() {
        assert_eq!(ranking_lines(Vec::<(&str, String)>::new()), "");
    }
}
