use anyhow::Result;
use serenity::all::{Colour, CommandInteraction, Context, CreateEmbed, Permissions};
use tracing::info;

use crate::commands::{bool_option, find_command, reply, reply_embed, str_option, CommandHandler, COMMANDS};

const COLUMN_LIMIT: usize = 10;

/// Names as a code list, capped at ten with an overflow count.
pub fn status_column(names: &[&str]) -> String {
    if names.is_empty() {
        return "None".to_string();
    }

    let mut column = names
        .iter()
        .take(COLUMN_LIMIT)
        .map(|name| format!("`/{}`", name))
        .collect::<Vec<_>>()
        .join("\n");
    if names.len() > COLUMN_LIMIT {
        column.push_str(&format!("\n... and {} more", names.len() - COLUMN_LIMIT));
    }
    column
}

impl CommandHandler {
    pub(crate) async fn handle_command_status(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::ADMINISTRATOR).await? {
            return Ok(());
        }

        let mut enabled = Vec::new();
        let mut disabled = Vec::new();
        for entry in COMMANDS.iter().filter(|entry| entry.gated) {
            if self.status.get_status(entry.name, command.guild_id, true).await {
                enabled.push(entry.name);
            } else {
                disabled.push(entry.name);
            }
        }

        let embed = CreateEmbed::new()
            .title("⚙️ Command status")
            .colour(Colour::BLUE)
            .field("✅ Enabled", status_column(&enabled), true)
            .field("❌ Disabled", status_column(&disabled), true);

        reply_embed(ctx, command, embed, true).await
    }

    pub(crate) async fn handle_set_command(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        is_enabled: bool,
    ) -> Result<()> {
        if !self.require(ctx, command, Permissions::ADMINISTRATOR).await? {
            return Ok(());
        }

        let name = str_option(command, "command_name")
            .unwrap_or_default()
            .trim()
            .trim_start_matches('/')
            .to_lowercase();
        let Some(entry) = find_command(&name) else {
            return reply(ctx, command, format!("❌ Unknown command `/{}`.", name), true).await;
        };
        if !entry.gated {
            return reply(
                ctx,
                command,
                format!("❌ `/{}` is always available and cannot be toggled.", entry.name),
                true,
            )
            .await;
        }

        let scope = if bool_option(command, "global").unwrap_or(false) {
            None
        } else {
            command.guild_id
        };

        self.status.set_status(entry.name, is_enabled, scope).await?;
        info!(
            "[COMMAND STATUS] {} ({}) {} /{}",
            command.user.name,
            command.user.id,
            if is_enabled { "enabled" } else { "disabled" },
            entry.name
        );

        let (icon, state) = if is_enabled { ("✅", "enabled") } else { ("❌", "disabled") };
        let scope_label = if scope.is_some() { "in this guild" } else { "globally" };
        reply(
            ctx,
            command,
            format!("{} `/{}` is now {} {}.", icon, entry.name, state, scope_label),
            true,
        )
        .await?;

        self.audit(ctx)
            .status_change(&command.user, command.channel_id, entry.name, is_enabled, scope)
            .await;
        Ok(())
    }

    pub(crate) async fn handle_list_commands_status(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::ADMINISTRATOR).await? {
            return Ok(());
        }

        let global = bool_option(command, "global").unwrap_or(false);
        let scope = if global { None } else { command.guild_id };
        let statuses = self.status.all_statuses(scope).await?;

        let enabled: Vec<_> = statuses
            .iter()
            .filter(|(_, is_enabled)| **is_enabled)
            .map(|(name, _)| name.as_str())
            .collect();
        let disabled: Vec<_> = statuses
            .iter()
            .filter(|(_, is_enabled)| !**is_enabled)
            .map(|(name, _)| name.as_str())
            .collect();

        let embed = CreateEmbed::new()
            .title(if global { "📋 Stored command flags (global)" } else { "📋 Stored command flags" })
            .colour(Colour::BLUE)
            .field(format!("✅ Enabled ({})", enabled.len()), status_column(&enabled), true)
            .field(format!("❌ Disabled ({})", disabled.len()), status_column(&disabled), true);

        reply_embed(ctx, command, embed, true).await
    }

    pub(crate) async fn handle_clear_command_cache(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::ADMINISTRATOR).await? {
            return Ok(());
        }

        self.status.clear_cache();
        reply(ctx, command, "🧹 Command status cache cleared.", true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_column_empty() {
        assert_eq!(status_column(&[]), "None");
    }

    #[test]
    fn test_status_column_caps_at_ten() {
        let names: Vec<String> = (0..13).map(|i| format!("cmd{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();

        let column = status_column(&refs);
        assert_eq!(column.lines().count(), 11);
        assert!(column.starts_with("`/cmd0`"));
        assert!(column.ends_with("... and 3 more"));
    }
}
