use std::sync::Arc;

use serenity::all::{
    ChannelId, Colour, CreateEmbed, CreateEmbedFooter, CreateMessage, GuildId, Http, Member,
    Timestamp, User, UserId,
};
use tracing::error;

use crate::config::Config;

const SANCTION_COMMANDS: &[&str] = &["warn", "kick", "ban", "mute", "tempban", "tempmute", "unmute", "clear"];
const FUN_COMMANDS: &[&str] = &["voice", "voice-leaderboard", "check-voice", "message-stats", "message-leaderboard"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Sanction,
    Fun,
    System,
}

impl CommandClass {
    pub fn of(command_name: &str) -> Self {
        if SANCTION_COMMANDS.contains(&command_name) {
            Self::Sanction
        } else if FUN_COMMANDS.contains(&command_name) {
            Self::Fun
        } else {
            Self::System
        }
    }

    fn title(self) -> &'static str {
        match self {
            Self::Sanction => "🛡️ Moderation action",
            Self::Fun => "📝 Command used",
            Self::System => "⚙️ System command",
        }
    }

    fn colour(self) -> Colour {
        match self {
            Self::Sanction => Colour::RED,
            Self::Fun => Colour::DARK_GREEN,
            Self::System => Colour::BLUE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEvent {
    Join,
    Leave,
    Move,
    RoleAssigned,
}

impl VoiceEvent {
    fn title(self) -> &'static str {
        match self {
            Self::Join => "🔊 Voice join",
            Self::Leave => "🔇 Voice leave",
            Self::Move => "🔀 Voice move",
            Self::RoleAssigned => "🏅 Voice role granted",
        }
    }

    fn colour(self) -> Colour {
        match self {
            Self::Join => Colour::DARK_GREEN,
            Self::Leave => Colour::RED,
            Self::Move => Colour::ORANGE,
            Self::RoleAssigned => Colour::GOLD,
        }
    }
}

/// Posts audit embeds to the configured log channels. Delivery failures are
/// logged and never bubble up.
#[derive(Clone)]
pub struct AuditLog {
    http: Arc<Http>,
    config: Arc<Config>,
}

impl AuditLog {
    pub fn new(http: Arc<Http>, config: Arc<Config>) -> Self {
        Self { http, config }
    }

    async fn post(&self, channel_id: ChannelId, embed: CreateEmbed) {
        if let Err(e) = channel_id
            .send_message(&self.http, CreateMessage::new().embed(embed))
            .await
        {
            error!("Failed to post audit log to channel {}: {}", channel_id, e);
        }
    }

    pub async fn command_usage(
        &self,
        user: &User,
        channel_id: ChannelId,
        command_name: &str,
        target: Option<UserId>,
        reason: Option<&str>,
    ) {
        let class = CommandClass::of(command_name);
        let mut embed = CreateEmbed::new()
            .title(class.title())
            .description(format!("<@{}> used **/{}**", user.id, command_name))
            .thumbnail(user.face())
            .colour(class.colour())
            .timestamp(Timestamp::now());

        if let Some(target) = target {
            embed = embed.field("👤 Target", format!("<@{}>", target), true);
        }
        if let Some(reason) = reason {
            embed = embed.field("📋 Reason", reason, true);
        }
        embed = embed.field("📍 Channel", format!("<#{}>", channel_id), true);

        self.post(self.config.command_log_channel(), embed).await;
    }

    pub async fn sanction(
        &self,
        target: UserId,
        action: &str,
        reason: Option<&str>,
        moderator: &User,
        duration: Option<&str>,
    ) {
        let mut embed = CreateEmbed::new()
            .title(format!("🔨 Sanction: {}", action))
            .description(format!("<@{}> was {}", target, action))
            .colour(Colour::RED)
            .field("Moderator", format!("<@{}>", moderator.id), true)
            .field("Reason", reason.unwrap_or("No reason given"), true)
            .timestamp(Timestamp::now())
            .footer(CreateEmbedFooter::new(format!("User ID: {}", target)));

        if let Some(duration) = duration {
            embed = embed.field("Duration", duration, true);
        }

        self.post(self.config.admin_log_channel(), embed).await;
    }

    pub async fn voice_event(&self, event: VoiceEvent, user_id: UserId, content: &str) {
        let embed = CreateEmbed::new()
            .title(event.title())
            .description(format!("<@{}> {}", user_id, content))
            .colour(event.colour())
            .timestamp(Timestamp::now())
            .footer(CreateEmbedFooter::new(format!("User ID: {}", user_id)));

        self.post(self.config.voice_log_channel(), embed).await;
    }

    pub async fn status_change(
        &self,
        moderator: &User,
        channel_id: ChannelId,
        command_name: &str,
        is_enabled: bool,
        guild: Option<GuildId>,
    ) {
        let (icon, state, colour) = if is_enabled {
            ("✅", "enabled", Colour::DARK_GREEN)
        } else {
            ("❌", "disabled", Colour::RED)
        };
        let scope = match guild {
            Some(guild_id) => format!("guild {}", guild_id),
            None => "global".to_string(),
        };

        let embed = CreateEmbed::new()
            .title(format!("{} Command status changed", icon))
            .description(format!(
                "**Command:** `/{}`\n**New status:** {}\n**Scope:** {}",
                command_name, state, scope
            ))
            .thumbnail(moderator.face())
            .colour(colour)
            .field("👤 Moderator", format!("<@{}>", moderator.id), true)
            .field("📍 Channel", format!("<#{}>", channel_id), true)
            .timestamp(Timestamp::now());

        self.post(self.config.command_log_channel(), embed).await;
    }

    pub async fn member_joined(&self, member: &Member, member_count: Option<u64>) {
        let user = &member.user;

        if let Some(welcome) = self.config.welcome_channel_id {
            let mut embed = CreateEmbed::new()
                .title("🎉 Welcome to the server!")
                .description(format!(
                    "Hi <@{}>, welcome aboard! Have a look at the rules and enjoy your stay.",
                    user.id
                ))
                .thumbnail(user.face())
                .colour(Colour::DARK_GREEN);
            if let Some(count) = member_count {
                embed = embed.footer(CreateEmbedFooter::new(format!("We are now {} members.", count)));
            }
            self.post(welcome, embed).await;
        }

        let embed = CreateEmbed::new()
            .title("🟢 New member")
            .description(format!("<@{}> joined the server.", user.id))
            .field("Username", &user.name, true)
            .field("Account created", format!("<t:{}:D>", user.created_at().unix_timestamp()), true)
            .thumbnail(user.face())
            .colour(Colour::DARK_GREEN)
            .footer(CreateEmbedFooter::new(format!("ID: {}", user.id)));
        self.post(self.config.log_channel_id, embed).await;
    }

    pub async fn member_left(&self, user: &User, member: Option<&Member>, member_count: Option<u64>) {
        if let Some(welcome) = self.config.welcome_channel_id {
            let mut embed = CreateEmbed::new()
                .title("💔 A member left...")
                .description(format!("<@{}> left the server. 😢", user.id))
                .thumbnail(user.face())
                .colour(Colour::RED);
            if let Some(count) = member_count {
                embed = embed.footer(CreateEmbedFooter::new(format!("We are now {} members.", count)));
            }
            self.post(welcome, embed).await;
        }

        let mut embed = CreateEmbed::new()
            .title("🔴 Member left")
            .description(format!("<@{}> left the server.", user.id))
            .field("Username", &user.name, true)
            .field("Account created", format!("<t:{}:D>", user.created_at().unix_timestamp()), true)
            .thumbnail(user.face())
            .colour(Colour::RED)
            .footer(CreateEmbedFooter::new(format!("ID: {}", user.id)));
        if let Some(joined_at) = member.and_then(|m| m.joined_at) {
            embed = embed.field("Joined", format!("<t:{}:D>", joined_at.unix_timestamp()), true);
        }
        self.post(self.config.log_channel_id, embed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_class() {
        assert_eq!(CommandClass::of("warn"), CommandClass::Sanction);
        assert_eq!(CommandClass::of("tempmute"), CommandClass::Sanction);
        assert_eq!(CommandClass::of("voice-leaderboard"), CommandClass::Fun);
        assert_eq!(CommandClass::of("enable-command"), CommandClass::System);
    }
}
