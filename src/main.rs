use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serenity::all::{
    Colour, Context, CreateEmbed, CreateMessage, EventHandler, GatewayIntents, Guild, GuildId,
    Interaction, Member, Message, Ready, Timestamp, User, UserId, VoiceState,
};
use serenity::async_trait;
use serenity::client::Client;
use tokio_cron_scheduler::JobScheduler;
use tracing::{error, info};

mod anime;
mod audit;
mod command_status;
mod commands;
mod config;
mod db;
mod jobs;
mod management;
mod moderation;
mod stats;
mod voice;

use audit::{AuditLog, VoiceEvent};
use command_status::{CommandStatusManager, StatusCache};
use commands::CommandHandler;
use config::Config;
use db::Database;
use voice::{format_duration, SessionClose, VoiceTracker, VoiceTransition};

struct Handler {
    config: Arc<Config>,
    db: Database,
    tracker: Arc<VoiceTracker>,
    command_handler: CommandHandler,
    jobs_started: AtomicBool,
    scheduler: Mutex<Option<JobScheduler>>,
}

impl Handler {
    fn new(config: Arc<Config>, db: Database) -> Self {
        let tracker = Arc::new(VoiceTracker::new(Arc::new(db.clone())));
        let status = CommandStatusManager::new(
            Arc::new(db.clone()),
            StatusCache::new(config.command_status_ttl),
        );
        let command_handler = CommandHandler::new(db.clone(), status, tracker.clone(), config.clone());

        Self {
            config,
            db,
            tracker,
            command_handler,
            jobs_started: AtomicBool::new(false),
            scheduler: Mutex::new(None),
        }
    }

    fn audit(&self, ctx: &Context) -> AuditLog {
        AuditLog::new(ctx.http.clone(), self.config.clone())
    }

    fn username(ctx: &Context, state: &VoiceState) -> String {
        if let Some(member) = &state.member {
            return member.user.name.clone();
        }
        ctx.cache
            .user(state.user_id)
            .map(|user| user.name.clone())
            .unwrap_or_else(|| state.user_id.to_string())
    }

    async fn log_voice_close(&self, ctx: &Context, user_id: UserId, event: VoiceEvent, text: String, closed: &SessionClose) {
        let text = match closed {
            SessionClose::Recorded { seconds, .. } => format!("{} after {}", text, format_duration(*seconds)),
            _ => text,
        };
        self.audit(ctx).voice_event(event, user_id, &text).await;
    }

    /// Opens sessions for members already sitting in voice when the guild arrives.
    fn resume_voice_sessions(&self, guild: &Guild) {
        let occupants: Vec<_> = guild
            .voice_states
            .values()
            .filter_map(|state| {
                let channel_id = state.channel_id?;
                let member = guild.members.get(&state.user_id)?;
                if member.user.bot {
                    return None;
                }
                Some((state.user_id, channel_id, member.user.name.clone()))
            })
            .collect();

        let resumed = self.tracker.resume(occupants, Utc::now());
        info!(
            "[VOICE] Resumed {} session(s) in guild {} ({} open)",
            resumed,
            guild.id,
            self.tracker.open_sessions()
        );
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot || msg.guild_id.is_none() {
            return;
        }

        if let Err(e) = self
            .db
            .increment_message_count(msg.author.id, &msg.author.name, msg.channel_id)
            .await
        {
            error!("Failed to count message from {}: {}", msg.author.id, e);
        }

        let bot_id = ctx.cache.current_user().id;
        if msg.mentions_user_id(bot_id) {
            info!("[MENTION] {} mentioned the bot in {}", msg.author.name, msg.channel_id);
            if let Err(e) = msg
                .reply(&ctx.http, "👋 Hi! Type `/` to see what I can do.")
                .await
            {
                error!("Failed to answer mention: {}", e);
            }
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        if new.member.as_ref().map_or(false, |member| member.user.bot) {
            return;
        }

        let old_channel = old.as_ref().and_then(|state| state.channel_id);
        let Some(transition) = VoiceTransition::classify(old_channel, new.channel_id) else {
            return;
        };

        let user_id = new.user_id;
        let username = Self::username(&ctx, &new);
        let now = Utc::now();

        match transition {
            VoiceTransition::Join(channel_id) => {
                info!("[VOICE] {} ({}) joined {}", username, user_id, channel_id);
                self.tracker.on_join(user_id, channel_id, &username, now);
                self.audit(&ctx)
                    .voice_event(VoiceEvent::Join, user_id, &format!("joined <#{}>", channel_id))
                    .await;
            }
            VoiceTransition::Leave(channel_id) => {
                info!("[VOICE] {} ({}) left {}", username, user_id, channel_id);
                let closed = self.tracker.on_leave(user_id, now).await;
                self.log_voice_close(&ctx, user_id, VoiceEvent::Leave, format!("left <#{}>", channel_id), &closed)
                    .await;
            }
            VoiceTransition::Move { from, to } => {
                info!("[VOICE] {} ({}) moved {} -> {}", username, user_id, from, to);
                let closed = self.tracker.on_move(user_id, from, to, &username, now).await;
                self.log_voice_close(
                    &ctx,
                    user_id,
                    VoiceEvent::Move,
                    format!("moved from <#{}> to <#{}>", from, to),
                    &closed,
                )
                .await;
            }
        }
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        info!("[GUILD] Available: {} ({})", guild.name, guild.id);

        if guild.id == self.config.guild_id {
            self.resume_voice_sessions(&guild);
        }
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        match self
            .config
            .guild_id
            .set_commands(&ctx.http, commands::definitions())
            .await
        {
            Ok(registered) => info!(
                "Registered {} slash commands in guild {}",
                registered.len(),
                self.config.guild_id
            ),
            Err(e) => error!("Failed to register slash commands: {}", e),
        }

        if self.jobs_started.swap(true, Ordering::SeqCst) {
            info!("Reconnected, background jobs already running");
            return;
        }

        if let Some(channel_id) = self.config.bot_start_channel_id {
            let embed = CreateEmbed::new()
                .title("🚀 Hermes is online")
                .description(format!("Version {}", env!("CARGO_PKG_VERSION")))
                .colour(Colour::DARK_GREEN)
                .timestamp(Timestamp::now());
            if let Err(e) = channel_id
                .send_message(&ctx.http, CreateMessage::new().embed(embed))
                .await
            {
                error!("Failed to send startup message: {}", e);
            }
        }

        match jobs::start_background_jobs(Arc::new(ctx.clone()), self.db.clone(), self.config.clone()).await {
            Ok(scheduler) => *self.scheduler.lock() = Some(scheduler),
            Err(e) => {
                error!("Failed to start background jobs: {}", e);
                self.jobs_started.store(false, Ordering::SeqCst);
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            self.command_handler.dispatch(&ctx, &command).await;
        }
    }

    async fn guild_member_addition(&self, ctx: Context, new_member: Member) {
        info!(
            "[MEMBER JOIN] {} ({}) joined guild {}",
            new_member.user.name, new_member.user.id, new_member.guild_id
        );

        let member_count = ctx
            .cache
            .guild(new_member.guild_id)
            .map(|guild| guild.member_count);
        self.audit(&ctx).member_joined(&new_member, member_count).await;
    }

    async fn guild_member_removal(
        &self,
        ctx: Context,
        guild_id: GuildId,
        user: User,
        member_data: Option<Member>,
    ) {
        info!("[MEMBER LEAVE] {} ({}) left guild {}", user.name, user.id, guild_id);

        let member_count = ctx.cache.guild(guild_id).map(|guild| guild.member_count);
        self.audit(&ctx)
            .member_left(&user, member_data.as_ref(), member_count)
            .await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let file_appender = tracing_appender::rolling::daily("logs", "hermes.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .json()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .pretty();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hermes=info".parse()?)
                .add_directive("serenity=warn".parse()?),
        )
        .with(file_layer)
        .with(console_layer)
        .init();

    let config = Arc::new(Config::from_env()?);

    info!("Connecting to database...");
    let db = Database::new(&config.database_url).await?;

    info!("Running database migrations...");
    db.run_migrations().await?;

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::MESSAGE_CONTENT;

    let handler = Handler::new(config.clone(), db);

    let mut client = Client::builder(&config.token, intents)
        .event_handler(handler)
        .await?;

    info!("Starting Discord bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}
