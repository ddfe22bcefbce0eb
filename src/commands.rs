use std::sync::Arc;

use anyhow::Result;
use serenity::all::{
    CommandDataOptionValue, CommandInteraction, CommandOptionType, Context, CreateCommand,
    CreateCommandOption, CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage,
    GuildId, Permissions, User, UserId,
};
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::command_status::{disabled_notice, CommandStatusManager};
use crate::config::Config;
use crate::db::Database;
use crate::voice::VoiceTracker;

pub struct CommandInfo {
    pub name: &'static str,
    pub gated: bool,
}

/// Every registered slash command. Ungated commands skip the status guard so
/// that admins can always re-enable things.
pub const COMMANDS: &[CommandInfo] = &[
    CommandInfo { name: "warn", gated: true },
    CommandInfo { name: "check-warn", gated: true },
    CommandInfo { name: "kick", gated: true },
    CommandInfo { name: "ban", gated: true },
    CommandInfo { name: "tempban", gated: true },
    CommandInfo { name: "mute", gated: true },
    CommandInfo { name: "tempmute", gated: true },
    CommandInfo { name: "unmute", gated: true },
    CommandInfo { name: "clear", gated: true },
    CommandInfo { name: "role", gated: true },
    CommandInfo { name: "list-users", gated: true },
    CommandInfo { name: "rules", gated: true },
    CommandInfo { name: "voice", gated: true },
    CommandInfo { name: "voice-leaderboard", gated: false },
    CommandInfo { name: "check-voice", gated: true },
    CommandInfo { name: "message-stats", gated: true },
    CommandInfo { name: "message-leaderboard", gated: true },
    CommandInfo { name: "command-status", gated: true },
    CommandInfo { name: "enable-command", gated: false },
    CommandInfo { name: "disable-command", gated: true },
    CommandInfo { name: "list-commands-status", gated: true },
    CommandInfo { name: "clear-command-cache", gated: false },
];

pub fn find_command(name: &str) -> Option<&'static CommandInfo> {
    COMMANDS.iter().find(|entry| entry.name == name)
}

pub fn is_gated(name: &str) -> bool {
    find_command(name).map_or(false, |entry| entry.gated)
}

/// Administrators implicitly hold every permission.
pub fn permission_granted(permissions: Option<Permissions>, required: Permissions) -> bool {
    match permissions {
        Some(permissions) => permissions.administrator() || permissions.contains(required),
        None => false,
    }
}

fn user_option(name: &str, description: &str, required: bool) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::User, name, description).required(required)
}

fn reason_option(required: bool) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::String, "reason", "Reason for the sanction")
        .required(required)
}

fn duration_options() -> [CreateCommandOption; 2] {
    let unit = ["seconds", "minutes", "hours", "days", "months", "years"]
        .into_iter()
        .fold(
            CreateCommandOption::new(CommandOptionType::String, "unit", "Time unit").required(true),
            |option, unit| option.add_string_choice(unit, unit),
        );

    [
        CreateCommandOption::new(CommandOptionType::Integer, "duration", "How long")
            .required(true)
            .min_int_value(1),
        unit,
    ]
}

fn command_name_option() -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::String, "command_name", "Name of the command")
        .required(true)
}

fn global_option() -> CreateCommandOption {
    CreateCommandOption::new(
        CommandOptionType::Boolean,
        "global",
        "Apply to every guild instead of this one",
    )
    .required(false)
}

/// Slash command definitions registered on the home guild.
pub fn definitions() -> Vec<CreateCommand> {
    let [duration, unit] = duration_options();
    let [tempmute_duration, tempmute_unit] = duration_options();

    vec![
        CreateCommand::new("warn")
            .description("Warn a member")
            .default_member_permissions(Permissions::MANAGE_MESSAGES)
            .add_option(user_option("user", "Member to warn", true))
            .add_option(reason_option(true)),
        CreateCommand::new("check-warn")
            .description("Show a member's latest warnings")
            .default_member_permissions(Permissions::MANAGE_MESSAGES)
            .add_option(user_option("user", "Member to inspect", true)),
        CreateCommand::new("kick")
            .description("Kick a member")
            .default_member_permissions(Permissions::KICK_MEMBERS)
            .add_option(user_option("user", "Member to kick", true))
            .add_option(reason_option(false)),
        CreateCommand::new("ban")
            .description("Ban a member")
            .default_member_permissions(Permissions::BAN_MEMBERS)
            .add_option(user_option("user", "Member to ban", true))
            .add_option(reason_option(false)),
        CreateCommand::new("tempban")
            .description("Ban a member for a limited time")
            .default_member_permissions(Permissions::BAN_MEMBERS)
            .add_option(user_option("user", "Member to ban", true))
            .add_option(duration)
            .add_option(unit)
            .add_option(reason_option(false)),
        CreateCommand::new("mute")
            .description("Mute a member")
            .default_member_permissions(Permissions::MANAGE_ROLES)
            .add_option(user_option("user", "Member to mute", true))
            .add_option(reason_option(false)),
        CreateCommand::new("tempmute")
            .description("Mute a member for a limited time")
            .default_member_permissions(Permissions::MANAGE_ROLES)
            .add_option(user_option("user", "Member to mute", true))
            .add_option(tempmute_duration)
            .add_option(tempmute_unit)
            .add_option(reason_option(false)),
        CreateCommand::new("unmute")
            .description("Unmute a member")
            .default_member_permissions(Permissions::MANAGE_ROLES)
            .add_option(user_option("user", "Member to unmute", true))
            .add_option(reason_option(false)),
        CreateCommand::new("clear")
            .description("Delete recent messages in this channel")
            .default_member_permissions(Permissions::MANAGE_MESSAGES)
            .add_option(
                CreateCommandOption::new(CommandOptionType::Integer, "amount", "Number of messages")
                    .required(true)
                    .min_int_value(1)
                    .max_int_value(100),
            ),
        CreateCommand::new("role")
            .description("Give a role to a member")
            .default_member_permissions(Permissions::MANAGE_ROLES)
            .add_option(user_option("user", "Member to update", true))
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "role_name", "Name of the role")
                    .required(true),
            ),
        CreateCommand::new("list-users")
            .description("Export every member with their roles")
            .default_member_permissions(Permissions::ADMINISTRATOR),
        CreateCommand::new("rules").description("Show the server rules"),
        CreateCommand::new("voice")
            .description("Voice time statistics")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "action", "What to show")
                    .required(true)
                    .add_string_choice("time", "time")
                    .add_string_choice("top", "top"),
            )
            .add_option(user_option("user", "Member to inspect", false)),
        CreateCommand::new("voice-leaderboard").description("Top 10 voice users"),
        CreateCommand::new("check-voice").description("Your total voice time"),
        CreateCommand::new("message-stats")
            .description("Message statistics of a member")
            .add_option(user_option("user", "Member to inspect", false)),
        CreateCommand::new("message-leaderboard").description("Top 10 message senders"),
        CreateCommand::new("command-status")
            .description("Enabled and disabled commands in this guild")
            .default_member_permissions(Permissions::ADMINISTRATOR),
        CreateCommand::new("enable-command")
            .description("Enable a command")
            .default_member_permissions(Permissions::ADMINISTRATOR)
            .add_option(command_name_option())
            .add_option(global_option()),
        CreateCommand::new("disable-command")
            .description("Disable a command")
            .default_member_permissions(Permissions::ADMINISTRATOR)
            .add_option(command_name_option())
            .add_option(global_option()),
        CreateCommand::new("list-commands-status")
            .description("Stored command flags")
            .default_member_permissions(Permissions::ADMINISTRATOR)
            .add_option(global_option()),
        CreateCommand::new("clear-command-cache")
            .description("Drop cached command flags")
            .default_member_permissions(Permissions::ADMINISTRATOR),
    ]
}

pub(crate) fn option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a CommandDataOptionValue> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .map(|opt| &opt.value)
}

pub(crate) fn str_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    option(command, name).and_then(|value| value.as_str())
}

pub(crate) fn int_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    option(command, name).and_then(|value| value.as_i64())
}

pub(crate) fn bool_option(command: &CommandInteraction, name: &str) -> Option<bool> {
    option(command, name).and_then(|value| value.as_bool())
}

pub(crate) fn user_id_option(command: &CommandInteraction, name: &str) -> Option<UserId> {
    option(command, name).and_then(|value| value.as_user_id())
}

/// The resolved user behind a user option, if the gateway sent it along.
pub(crate) fn resolved_user<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a User> {
    let user_id = user_id_option(command, name)?;
    command.data.resolved.users.get(&user_id)
}

pub(crate) async fn reply(
    ctx: &Context,
    command: &CommandInteraction,
    content: impl Into<String>,
    ephemeral: bool,
) -> Result<()> {
    let response = CreateInteractionResponse::Message(
        CreateInteractionResponseMessage::new()
            .content(content)
            .ephemeral(ephemeral),
    );
    command.create_response(&ctx.http, response).await?;
    Ok(())
}

pub(crate) async fn reply_embed(
    ctx: &Context,
    command: &CommandInteraction,
    embed: CreateEmbed,
    ephemeral: bool,
) -> Result<()> {
    let response = CreateInteractionResponse::Message(
        CreateInteractionResponseMessage::new()
            .embed(embed)
            .ephemeral(ephemeral),
    );
    command.create_response(&ctx.http, response).await?;
    Ok(())
}

pub struct CommandHandler {
    pub(crate) db: Database,
    pub(crate) status: CommandStatusManager,
    pub(crate) tracker: Arc<VoiceTracker>,
    pub(crate) config: Arc<Config>,
}

/// The refusal to send when `name` is gated and disabled in `guild_id`.
pub async fn guard(status: &CommandStatusManager, name: &str, guild_id: Option<GuildId>) -> Option<String> {
    if is_gated(name) && !status.is_enabled(name, guild_id).await {
        Some(disabled_notice(name))
    } else {
        None
    }
}

impl CommandHandler {
    pub fn new(
        db: Database,
        status: CommandStatusManager,
        tracker: Arc<VoiceTracker>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            status,
            tracker,
            config,
        }
    }

    pub(crate) fn audit(&self, ctx: &Context) -> AuditLog {
        AuditLog::new(ctx.http.clone(), self.config.clone())
    }

    /// Replies with a refusal when the member lacks `required`. Returns whether
    /// the handler may go on.
    pub(crate) async fn require(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        required: Permissions,
    ) -> Result<bool> {
        let permissions = command.member.as_ref().and_then(|member| member.permissions);
        if permission_granted(permissions, required) {
            return Ok(true);
        }

        info!(
            "[SLASH COMMAND] {} ({}) lacks {:?} for /{}",
            command.user.name, command.user.id, required, command.data.name
        );
        reply(
            ctx,
            command,
            "❌ You don't have permission to use this command.",
            true,
        )
        .await?;
        Ok(false)
    }

    pub async fn dispatch(&self, ctx: &Context, command: &CommandInteraction) {
        let name = command.data.name.as_str();

        info!(
            "[SLASH COMMAND] {} ({}) used /{} in channel {}",
            command.user.name, command.user.id, name, command.channel_id
        );

        if let Some(notice) = guard(&self.status, name, command.guild_id).await {
            info!("[COMMAND STATUS] Refused disabled command /{}", name);
            if let Err(e) = reply(ctx, command, notice, true).await {
                error!("Failed to send disabled notice for /{}: {}", name, e);
            }
            return;
        }

        self.audit(ctx)
            .command_usage(
                &command.user,
                command.channel_id,
                name,
                user_id_option(command, "user"),
                str_option(command, "reason"),
            )
            .await;

        let result = match name {
            "warn" => self.handle_warn(ctx, command).await,
            "check-warn" => self.handle_check_warn(ctx, command).await,
            "kick" => self.handle_kick(ctx, command).await,
            "ban" => self.handle_ban(ctx, command).await,
            "tempban" => self.handle_tempban(ctx, command).await,
            "mute" => self.handle_mute(ctx, command).await,
            "tempmute" => self.handle_tempmute(ctx, command).await,
            "unmute" => self.handle_unmute(ctx, command).await,
            "clear" => self.handle_clear(ctx, command).await,
            "role" => self.handle_role(ctx, command).await,
            "list-users" => self.handle_list_users(ctx, command).await,
            "rules" => self.handle_rules(ctx, command).await,
            "voice" => self.handle_voice(ctx, command).await,
            "voice-leaderboard" => self.handle_voice_leaderboard(ctx, command).await,
            "check-voice" => self.handle_check_voice(ctx, command).await,
            "message-stats" => self.handle_message_stats(ctx, command).await,
            "message-leaderboard" => self.handle_message_leaderboard(ctx, command).await,
            "command-status" => self.handle_command_status(ctx, command).await,
            "enable-command" => self.handle_set_command(ctx, command, true).await,
            "disable-command" => self.handle_set_command(ctx, command, false).await,
            "list-commands-status" => self.handle_list_commands_status(ctx, command).await,
            "clear-command-cache" => self.handle_clear_command_cache(ctx, command).await,
            _ => {
                warn!("Unknown slash command /{}", name);
                Ok(())
            }
        };

        if let Err(e) = result {
            error!("Failed to handle /{}: {:?}", name, e);
            // fails silently if the handler already answered
            reply(ctx, command, "❌ Something went wrong while running this command.", true)
                .await
                .ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_status::{CommandStatusStore, StatusCache, DEFAULT_STATUS_TTL};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct MemoryStatusStore {
        rows: Mutex<HashMap<(String, Option<GuildId>), bool>>,
    }

    #[async_trait]
    impl CommandStatusStore for MemoryStatusStore {
        async fn fetch_status(&self, command_name: &str, guild_id: Option<GuildId>) -> Result<Option<bool>> {
            Ok(self.rows.lock().get(&(command_name.to_string(), guild_id)).copied())
        }

        async fn upsert_status(&self, command_name: &str, guild_id: Option<GuildId>, is_enabled: bool) -> Result<()> {
            self.rows.lock().insert((command_name.to_string(), guild_id), is_enabled);
            Ok(())
        }

        async fn insert_default_status(&self, command_name: &str, guild_id: Option<GuildId>) -> Result<()> {
            self.rows.lock().entry((command_name.to_string(), guild_id)).or_insert(true);
            Ok(())
        }

        async fn list_statuses(&self, _guild_id: Option<GuildId>) -> Result<Vec<(String, bool)>> {
            Ok(Vec::new())
        }
    }

    fn status_manager() -> CommandStatusManager {
        CommandStatusManager::new(
            Arc::new(MemoryStatusStore::default()),
            StatusCache::new(DEFAULT_STATUS_TTL),
        )
    }

    #[tokio::test]
    async fn test_guard_refuses_only_in_disabled_guild() {
        let status = status_manager();
        status.set_status("warn", false, Some(GuildId::new(42))).await.unwrap();

        assert_eq!(
            guard(&status, "warn", Some(GuildId::new(42))).await,
            Some(disabled_notice("warn"))
        );
        assert_eq!(guard(&status, "warn", Some(GuildId::new(99))).await, None);
    }

    #[tokio::test]
    async fn test_guard_skips_ungated_commands() {
        let status = status_manager();
        status.set_status("enable-command", false, Some(GuildId::new(42))).await.unwrap();

        assert_eq!(guard(&status, "enable-command", Some(GuildId::new(42))).await, None);
    }

    #[test]
    fn test_definitions_match_command_table() {
        let table: HashSet<_> = COMMANDS.iter().map(|entry| entry.name).collect();
        assert_eq!(table.len(), COMMANDS.len());
        assert_eq!(definitions().len(), COMMANDS.len());
    }

    #[test]
    fn test_gating() {
        assert!(is_gated("warn"));
        assert!(is_gated("disable-command"));
        assert!(!is_gated("enable-command"));
        assert!(!is_gated("clear-command-cache"));
        assert!(!is_gated("voice-leaderboard"));
        assert!(!is_gated("nope"));
    }

    #[test]
    fn test_permission_granted() {
        assert!(!permission_granted(None, Permissions::KICK_MEMBERS));
        assert!(permission_granted(
            Some(Permissions::KICK_MEMBERS | Permissions::SEND_MESSAGES),
            Permissions::KICK_MEMBERS
        ));
        assert!(!permission_granted(
            Some(Permissions::SEND_MESSAGES),
            Permissions::BAN_MEMBERS
        ));
        assert!(permission_granted(
            Some(Permissions::ADMINISTRATOR),
            Permissions::MANAGE_ROLES
        ));
    }
}
