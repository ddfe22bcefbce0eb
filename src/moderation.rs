use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serenity::all::{
    ChannelId, Colour, CommandInteraction, Context, CreateAttachment, CreateEmbed, CreateEmbedFooter,
    CreateInteractionResponseFollowup, CreateMessage, EditRole, GetMessages, GuildId, Http, Member,
    MessageId, PermissionOverwrite, PermissionOverwriteType, Permissions, Role, RoleId, User, UserId,
};
use tracing::{error, info, warn};

use crate::commands::{int_option, reply, reply_embed, resolved_user, str_option, user_id_option, CommandHandler};

pub const MUTE_ROLE: &str = "mute";

const BAN_DELETE_MESSAGE_DAYS: u8 = 7;
const BULK_DELETE_MAX_AGE_SECS: i64 = 14 * 24 * 3600;
const MEMBER_PAGE: u64 = 1000;

/// Server rules, posted one embed per rule.
pub const RULES: &[(&str, &str)] = &[(
    "1- Mutual respect, including towards the moderators",
    "Respecting others is mandatory. No judging, harassment or witch hunts, whatever the means, \
     or the moderators will step in with sanctions.",
)];

/// Seconds in one `unit`. English and French spellings, singular or plural.
pub fn unit_seconds(unit: &str) -> Option<u64> {
    let seconds = match unit.trim().to_lowercase().as_str() {
        "s" | "sec" | "second" | "seconds" | "seconde" | "secondes" => 1,
        "min" | "minute" | "minutes" => 60,
        "h" | "hour" | "hours" | "heure" | "heures" => 3600,
        "d" | "day" | "days" | "jour" | "jours" => 86_400,
        "month" | "months" | "mois" => 30 * 86_400,
        "y" | "year" | "years" | "an" | "ans" | "annee" | "annees" | "année" | "années" => 365 * 86_400,
        _ => return None,
    };
    Some(seconds)
}

pub fn sanction_duration(amount: i64, unit: &str) -> Option<Duration> {
    let amount = u64::try_from(amount).ok().filter(|a| *a > 0)?;
    let seconds = unit_seconds(unit)?.checked_mul(amount)?;
    Some(Duration::from_secs(seconds))
}

/// Discord refuses to bulk-delete messages older than two weeks.
pub fn bulk_deletable(age_secs: i64) -> bool {
    age_secs < BULK_DELETE_MAX_AGE_SECS
}

/// One line of the member listing: `name (ID: id) - Roles: a, b`.
pub fn member_line(member: &Member, roles: &HashMap<RoleId, Role>) -> String {
    let names: Vec<&str> = member
        .roles
        .iter()
        .filter_map(|role_id| roles.get(role_id))
        .map(|role| role.name.as_str())
        .filter(|name| *name != "@everyone")
        .collect();

    format!(
        "{} (ID: {}) - Roles: {}",
        member.user.name,
        member.user.id,
        if names.is_empty() { "none".to_string() } else { names.join(", ") }
    )
}

fn guild_of(command: &CommandInteraction) -> Result<GuildId> {
    command
        .guild_id
        .ok_or_else(|| anyhow!("/{} used outside a guild", command.data.name))
}

async fn target_user(ctx: &Context, command: &CommandInteraction) -> Result<User> {
    if let Some(user) = resolved_user(command, "user") {
        return Ok(user.clone());
    }
    let user_id = user_id_option(command, "user").ok_or_else(|| anyhow!("missing user option"))?;
    Ok(user_id.to_user(ctx).await?)
}

/// Looks up the mute role, creating it with channel overwrites on first use.
async fn mute_role(ctx: &Context, guild_id: GuildId) -> Result<RoleId> {
    let roles = guild_id.roles(&ctx.http).await?;
    if let Some(role) = roles.values().find(|role| role.name == MUTE_ROLE) {
        return Ok(role.id);
    }

    let role = guild_id
        .create_role(ctx, EditRole::new().name(MUTE_ROLE).permissions(Permissions::empty()))
        .await?;
    info!("[MOD ACTION] Created role {} ({}) in guild {}", MUTE_ROLE, role.id, guild_id);

    let channels = guild_id.channels(&ctx.http).await?;
    for channel_id in channels.keys() {
        let overwrite = PermissionOverwrite {
            allow: Permissions::empty(),
            deny: Permissions::SEND_MESSAGES | Permissions::SPEAK,
            kind: PermissionOverwriteType::Role(role.id),
        };
        if let Err(e) = channel_id.create_permission(&ctx.http, overwrite).await {
            warn!("Failed to set mute overwrite on channel {}: {}", channel_id, e);
        }
    }

    Ok(role.id)
}

fn schedule_unban(http: Arc<Http>, guild_id: GuildId, user_id: UserId, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match guild_id.unban(&http, user_id).await {
            Ok(()) => info!("[MOD ACTION] Temporary ban of {} expired, unbanned", user_id),
            Err(e) => error!("Failed to lift temporary ban of {}: {}", user_id, e),
        }
    });
}

fn schedule_unmute(http: Arc<Http>, guild_id: GuildId, user_id: UserId, role_id: RoleId, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match http
            .remove_member_role(guild_id, user_id, role_id, Some("Temporary mute expired"))
            .await
        {
            Ok(()) => info!("[MOD ACTION] Temporary mute of {} expired, unmuted", user_id),
            Err(e) => error!("Failed to lift temporary mute of {}: {}", user_id, e),
        }
    });
}

impl CommandHandler {
    pub(crate) async fn handle_warn(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::MANAGE_MESSAGES).await? {
            return Ok(());
        }

        let user = target_user(ctx, command).await?;
        let reason = str_option(command, "reason").unwrap_or("No reason given");

        self.db
            .add_warn(user.id, &user.name, reason, command.user.id)
            .await?;
        info!(
            "[MOD ACTION] {} warned {} ({}) - reason: {}",
            command.user.name, user.name, user.id, reason
        );

        let dm = CreateMessage::new().content(format!(
            "⚠️ You received a warning on the server.\n**Reason:** {}",
            reason
        ));
        let mut content = format!("⚠️ <@{}> has been warned. Reason: {}", user.id, reason);
        if let Err(e) = user.direct_message(ctx, dm).await {
            warn!("Could not DM warning to {}: {}", user.id, e);
            content.push_str("\n(The member could not be notified by DM.)");
        }

        reply(ctx, command, content, false).await?;
        self.audit(ctx)
            .sanction(user.id, "warned", Some(reason), &command.user, None)
            .await;
        Ok(())
    }

    pub(crate) async fn handle_check_warn(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::MANAGE_MESSAGES).await? {
            return Ok(());
        }

        let user = target_user(ctx, command).await?;
        let warnings = self.db.get_user_warns(user.id, 3).await?;
        let total = self.db.get_warn_count(user.id).await?;

        if warnings.is_empty() {
            return reply(ctx, command, format!("✅ <@{}> has no warnings.", user.id), true).await;
        }

        let mut embed = CreateEmbed::new()
            .title(format!("⚠️ Warnings of {}", user.name))
            .thumbnail(user.face())
            .colour(Colour::ORANGE)
            .footer(CreateEmbedFooter::new(format!("Total warnings: {}", total)));

        for warning in &warnings {
            embed = embed.field(
                format!("Warning #{}", warning.id),
                format!(
                    "**Reason:** {}\n**By:** <@{}>\n**When:** <t:{}:f>",
                    warning.reason, warning.moderator_id, warning.create_time
                ),
                false,
            );
        }

        reply_embed(ctx, command, embed, true).await
    }

    pub(crate) async fn handle_kick(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::KICK_MEMBERS).await? {
            return Ok(());
        }

        let guild_id = guild_of(command)?;
        let user = target_user(ctx, command).await?;
        let reason = str_option(command, "reason");

        match reason {
            Some(reason) => guild_id.kick_with_reason(&ctx.http, user.id, reason).await?,
            None => guild_id.kick(&ctx.http, user.id).await?,
        }
        info!(
            "[MOD ACTION] {} kicked {} ({}) - reason: {}",
            command.user.name,
            user.name,
            user.id,
            reason.unwrap_or("none")
        );

        reply(ctx, command, format!("👢 <@{}> has been kicked.", user.id), false).await?;
        self.audit(ctx)
            .sanction(user.id, "kicked", reason, &command.user, None)
            .await;
        Ok(())
    }

    pub(crate) async fn handle_ban(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::BAN_MEMBERS).await? {
            return Ok(());
        }

        let guild_id = guild_of(command)?;
        let user = target_user(ctx, command).await?;
        let reason = str_option(command, "reason");

        self.ban(ctx, guild_id, user.id, reason).await?;
        info!(
            "[MOD ACTION] {} banned {} ({}) - reason: {}",
            command.user.name,
            user.name,
            user.id,
            reason.unwrap_or("none")
        );

        reply(ctx, command, format!("🔨 <@{}> has been banned.", user.id), false).await?;
        self.audit(ctx)
            .sanction(user.id, "banned", reason, &command.user, None)
            .await;
        Ok(())
    }

    pub(crate) async fn handle_tempban(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::BAN_MEMBERS).await? {
            return Ok(());
        }

        let Some((delay, label)) = self.requested_duration(ctx, command).await? else {
            return Ok(());
        };
        let guild_id = guild_of(command)?;
        let user = target_user(ctx, command).await?;
        let reason = str_option(command, "reason");

        self.ban(ctx, guild_id, user.id, reason).await?;
        schedule_unban(ctx.http.clone(), guild_id, user.id, delay);
        info!(
            "[MOD ACTION] {} banned {} ({}) for {} - reason: {}",
            command.user.name,
            user.name,
            user.id,
            label,
            reason.unwrap_or("none")
        );

        reply(
            ctx,
            command,
            format!("🔨 <@{}> has been banned for {}.", user.id, label),
            false,
        )
        .await?;
        self.audit(ctx)
            .sanction(user.id, "temporarily banned", reason, &command.user, Some(&label))
            .await;
        Ok(())
    }

    pub(crate) async fn handle_mute(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::MANAGE_ROLES).await? {
            return Ok(());
        }

        let guild_id = guild_of(command)?;
        let user = target_user(ctx, command).await?;
        let reason = str_option(command, "reason");

        if self.mute(ctx, command, guild_id, &user, reason).await?.is_none() {
            return Ok(());
        }

        reply(ctx, command, format!("🔇 <@{}> has been muted.", user.id), false).await?;
        self.audit(ctx)
            .sanction(user.id, "muted", reason, &command.user, None)
            .await;
        Ok(())
    }

    pub(crate) async fn handle_tempmute(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::MANAGE_ROLES).await? {
            return Ok(());
        }

        let Some((delay, label)) = self.requested_duration(ctx, command).await? else {
            return Ok(());
        };
        let guild_id = guild_of(command)?;
        let user = target_user(ctx, command).await?;
        let reason = str_option(command, "reason");

        let Some(role_id) = self.mute(ctx, command, guild_id, &user, reason).await? else {
            return Ok(());
        };
        schedule_unmute(ctx.http.clone(), guild_id, user.id, role_id, delay);

        reply(
            ctx,
            command,
            format!("🔇 <@{}> has been muted for {}.", user.id, label),
            false,
        )
        .await?;
        self.audit(ctx)
            .sanction(user.id, "temporarily muted", reason, &command.user, Some(&label))
            .await;
        Ok(())
    }

    pub(crate) async fn handle_unmute(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::MANAGE_ROLES).await? {
            return Ok(());
        }

        let guild_id = guild_of(command)?;
        let user = target_user(ctx, command).await?;
        let reason = str_option(command, "reason");

        let role_id = mute_role(ctx, guild_id).await?;
        let member = guild_id.member(ctx, user.id).await?;
        if !member.roles.contains(&role_id) {
            return reply(ctx, command, format!("<@{}> is not muted.", user.id), true).await;
        }

        ctx.http
            .remove_member_role(guild_id, user.id, role_id, reason)
            .await?;
        info!(
            "[MOD ACTION] {} unmuted {} ({})",
            command.user.name, user.name, user.id
        );

        reply(ctx, command, format!("🔊 <@{}> has been unmuted.", user.id), false).await?;
        self.audit(ctx)
            .sanction(user.id, "unmuted", reason, &command.user, None)
            .await;
        Ok(())
    }

    pub(crate) async fn handle_clear(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::MANAGE_MESSAGES).await? {
            return Ok(());
        }

        let amount = int_option(command, "amount").unwrap_or(0);
        if !(1..=100).contains(&amount) {
            return reply(ctx, command, "❌ The amount must be between 1 and 100.", true).await;
        }

        let now = Utc::now().timestamp();
        let messages = command
            .channel_id
            .messages(ctx, GetMessages::new().limit(amount as u8))
            .await?;
        let deletable: Vec<_> = messages
            .iter()
            .filter(|msg| bulk_deletable(now - msg.timestamp.unix_timestamp()))
            .map(|msg| msg.id)
            .collect();

        delete_messages(ctx, command.channel_id, &deletable).await?;
        info!(
            "[MOD ACTION] {} cleared {} message(s) in channel {}",
            command.user.name,
            deletable.len(),
            command.channel_id
        );

        reply(
            ctx,
            command,
            format!("🧹 Deleted {} message(s).", deletable.len()),
            true,
        )
        .await
    }

    pub(crate) async fn handle_role(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::MANAGE_ROLES).await? {
            return Ok(());
        }

        let guild_id = guild_of(command)?;
        let user = target_user(ctx, command).await?;
        let role_name = str_option(command, "role_name").unwrap_or_default();

        let roles = guild_id.roles(&ctx.http).await?;
        let Some(role) = roles
            .values()
            .find(|role| role.name.eq_ignore_ascii_case(role_name.trim()))
        else {
            return reply(ctx, command, format!("❌ Role `{}` not found.", role_name), true).await;
        };

        let member = guild_id.member(ctx, user.id).await?;
        if member.roles.contains(&role.id) {
            return reply(
                ctx,
                command,
                format!("<@{}> already has the role {}.", user.id, role.name),
                true,
            )
            .await;
        }

        ctx.http
            .add_member_role(guild_id, user.id, role.id, Some("Role granted by command"))
            .await?;
        info!(
            "[ROLE] {} gave role {} to {} ({})",
            command.user.name, role.name, user.name, user.id
        );

        reply(
            ctx,
            command,
            format!("✅ <@{}> now has the role {}.", user.id, role.name),
            false,
        )
        .await
    }

    /// Sends a text file of every human member with their roles.
    pub(crate) async fn handle_list_users(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        if !self.require(ctx, command, Permissions::ADMINISTRATOR).await? {
            return Ok(());
        }

        let guild_id = guild_of(command)?;
        command.defer_ephemeral(&ctx.http).await?;

        let roles = guild_id.roles(&ctx.http).await?;
        let mut lines = Vec::new();
        let mut after = None;
        loop {
            let page = guild_id.members(&ctx.http, Some(MEMBER_PAGE), after).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.user.id);

            lines.extend(
                page.iter()
                    .filter(|member| !member.user.bot)
                    .map(|member| member_line(member, &roles)),
            );
            if (page.len() as u64) < MEMBER_PAGE {
                break;
            }
        }

        info!(
            "[LIST USERS] {} ({}) listed {} member(s) of guild {}",
            command.user.name, command.user.id, lines.len(), guild_id
        );

        let file = CreateAttachment::bytes(lines.join("\n").into_bytes(), "members.txt");
        command
            .create_followup(
                &ctx.http,
                CreateInteractionResponseFollowup::new()
                    .content(format!("📋 {} member(s), bots excluded, with their roles:", lines.len()))
                    .add_file(file)
                    .ephemeral(true),
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn handle_rules(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        reply(ctx, command, "📜 Here are the server rules.", false).await?;

        for (title, description) in RULES {
            let embed = CreateEmbed::new()
                .title(*title)
                .description(*description)
                .colour(Colour::from_rgb(0, 255, 0));
            command
                .channel_id
                .send_message(&ctx.http, CreateMessage::new().embed(embed))
                .await?;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(())
    }

    async fn ban(&self, ctx: &Context, guild_id: GuildId, user_id: UserId, reason: Option<&str>) -> Result<()> {
        match reason {
            Some(reason) => {
                guild_id
                    .ban_with_reason(&ctx.http, user_id, BAN_DELETE_MESSAGE_DAYS, reason)
                    .await?
            }
            None => guild_id.ban(&ctx.http, user_id, BAN_DELETE_MESSAGE_DAYS).await?,
        }
        Ok(())
    }

    /// Adds the mute role. `None` means the member was already muted and the
    /// caller has been told so.
    async fn mute(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        guild_id: GuildId,
        user: &User,
        reason: Option<&str>,
    ) -> Result<Option<RoleId>> {
        let role_id = mute_role(ctx, guild_id).await?;
        let member = guild_id.member(ctx, user.id).await?;
        if member.roles.contains(&role_id) {
            reply(ctx, command, format!("<@{}> is already muted.", user.id), true).await?;
            return Ok(None);
        }

        ctx.http
            .add_member_role(guild_id, user.id, role_id, reason)
            .await?;
        info!(
            "[MOD ACTION] {} muted {} ({}) - reason: {}",
            command.user.name,
            user.name,
            user.id,
            reason.unwrap_or("none")
        );
        Ok(Some(role_id))
    }

    /// Reads the `duration`/`unit` pair. Replies and returns `None` when invalid.
    async fn requested_duration(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
    ) -> Result<Option<(Duration, String)>> {
        let amount = int_option(command, "duration").unwrap_or(0);
        let unit = str_option(command, "unit").unwrap_or_default();

        match sanction_duration(amount, unit) {
            Some(delay) => Ok(Some((delay, format!("{} {}", amount, unit)))),
            None => {
                reply(
                    ctx,
                    command,
                    "❌ Invalid duration. Use a positive number and one of: seconds, minutes, hours, days, months, years.",
                    true,
                )
                .await?;
                Ok(None)
            }
        }
    }
}

async fn delete_messages(ctx: &Context, channel_id: ChannelId, ids: &[MessageId]) -> Result<()> {
    match ids {
        [] => {}
        [single] => channel_id.delete_message(&ctx.http, *single).await?,
        many => channel_id.delete_messages(&ctx.http, many).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_are_embed_sized() {
        assert!(!RULES.is_empty());
        for (title, description) in RULES {
            assert!(title.chars().count() <= 256);
            assert!(description.chars().count() <= 4096);
        }
    }

    #[test]
    fn test_unit_seconds_accepts_both_languages() {
        assert_eq!(unit_seconds("seconds"), Some(1));
        assert_eq!(unit_seconds("secondes"), Some(1));
        assert_eq!(unit_seconds("Minute"), Some(60));
        assert_eq!(unit_seconds("heures"), Some(3600));
        assert_eq!(unit_seconds("jour"), Some(86_400));
        assert_eq!(unit_seconds("mois"), Some(2_592_000));
        assert_eq!(unit_seconds("années"), Some(31_536_000));
        assert_eq!(unit_seconds("annees"), Some(31_536_000));
        assert_eq!(unit_seconds("fortnight"), None);
    }

    #[test]
    fn test_sanction_duration() {
        assert_eq!(sanction_duration(2, "hours"), Some(Duration::from_secs(7200)));
        assert_eq!(sanction_duration(1, "months"), Some(Duration::from_secs(30 * 86_400)));
        assert_eq!(sanction_duration(0, "hours"), None);
        assert_eq!(sanction_duration(-3, "days"), None);
        assert_eq!(sanction_duration(5, "weeks"), None);
        assert_eq!(sanction_duration(i64::MAX, "years"), None);
    }

    #[test]
    fn test_bulk_delete_window() {
        assert!(bulk_deletable(0));
        assert!(bulk_deletable(13 * 86_400));
        assert!(!bulk_deletable(14 * 86_400));
    }
}
