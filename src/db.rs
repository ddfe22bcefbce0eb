use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serenity::all::{ChannelId, GuildId, UserId};
use sqlx::{FromRow, PgPool};

use crate::command_status::CommandStatusStore;
use crate::voice::VoiceTimeStore;

#[derive(Debug, Clone, FromRow)]
pub struct UserVoiceTotal {
    pub user_id: i64,
    pub username: String,
    pub total_time: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Warning {
    pub id: i32,
    pub user_id: i64,
    pub reason: String,
    pub create_time: i64,
    pub moderator_id: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ChannelMessageCount {
    pub channel_id: i64,
    pub message_count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageLeader {
    pub user_id: i64,
    pub username: String,
    pub total_messages: i64,
}

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_voice_data (
                user_id BIGINT PRIMARY KEY,
                username VARCHAR(255) NOT NULL,
                total_time BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS warn (
                id SERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES user_voice_data(user_id),
                reason TEXT NOT NULL,
                create_time BIGINT NOT NULL,
                moderator_id BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_message_stats (
                user_id BIGINT NOT NULL REFERENCES user_voice_data(user_id),
                channel_id BIGINT NOT NULL,
                message_count BIGINT NOT NULL DEFAULT 1,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (user_id, channel_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS command_status (
                id SERIAL PRIMARY KEY,
                command_name VARCHAR(100) NOT NULL,
                guild_id BIGINT,
                is_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                UNIQUE NULLS NOT DISTINCT (command_name, guild_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sent_articles (
                article_hash CHAR(64) PRIMARY KEY,
                title TEXT NOT NULL,
                link TEXT NOT NULL,
                sent_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_user_voice_data(&self, user_id: UserId) -> Result<Option<UserVoiceTotal>> {
        let row = sqlx::query_as::<_, UserVoiceTotal>(
            "SELECT user_id, username, total_time FROM user_voice_data WHERE user_id = $1",
        )
        .bind(user_id.get() as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_top_voice_users(&self, limit: i64) -> Result<Vec<UserVoiceTotal>> {
        let rows = sqlx::query_as::<_, UserVoiceTotal>(
            "SELECT user_id, username, total_time FROM user_voice_data ORDER BY total_time DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Makes sure the user has a `user_voice_data` row, which warnings and
    /// message stats reference.
    pub async fn ensure_user(&self, user_id: UserId, username: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_voice_data (user_id, username) VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id.get() as i64)
        .bind(username)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn add_warn(&self, user_id: UserId, username: &str, reason: &str, moderator_id: UserId) -> Result<()> {
        self.ensure_user(user_id, username).await?;

        sqlx::query(
            "INSERT INTO warn (user_id, reason, create_time, moderator_id) VALUES ($1, $2, $3, $4)",
        )
        .bind(user_id.get() as i64)
        .bind(reason)
        .bind(Utc::now().timestamp())
        .bind(moderator_id.get() as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_user_warns(&self, user_id: UserId, limit: i64) -> Result<Vec<Warning>> {
        let rows = sqlx::query_as::<_, Warning>(
            r#"
            SELECT id, user_id, reason, create_time, moderator_id
            FROM warn
            WHERE user_id = $1
            ORDER BY create_time DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id.get() as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn get_warn_count(&self, user_id: UserId) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM warn WHERE user_id = $1")
            .bind(user_id.get() as i64)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    pub async fn increment_message_count(&self, user_id: UserId, username: &str, channel_id: ChannelId) -> Result<()> {
        self.ensure_user(user_id, username).await?;

        sqlx::query(
            r#"
            INSERT INTO user_message_stats (user_id, channel_id, message_count)
            VALUES ($1, $2, 1)
            ON CONFLICT (user_id, channel_id)
            DO UPDATE SET message_count = user_message_stats.message_count + 1,
                          updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(user_id.get() as i64)
        .bind(channel_id.get() as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_total_messages(&self, user_id: UserId) -> Result<i64> {
        let total = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT SUM(message_count)::BIGINT FROM user_message_stats WHERE user_id = $1",
        )
        .bind(user_id.get() as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(total.unwrap_or(0))
    }

    pub async fn get_top_channels(&self, user_id: UserId, limit: i64) -> Result<Vec<ChannelMessageCount>> {
        let rows = sqlx::query_as::<_, ChannelMessageCount>(
            r#"
            SELECT channel_id, message_count
            FROM user_message_stats
            WHERE user_id = $1
            ORDER BY message_count DESC
            LIMIT $2
            "#,
        )
        .bind(user_id.get() as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn get_message_leaderboard(&self, limit: i64) -> Result<Vec<MessageLeader>> {
        let rows = sqlx::query_as::<_, MessageLeader>(
            r#"
            SELECT u.user_id, u.username, SUM(s.message_count)::BIGINT AS total_messages
            FROM user_voice_data u
            JOIN user_message_stats s ON u.user_id = s.user_id
            GROUP BY u.user_id, u.username
            ORDER BY total_messages DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn is_article_sent(&self, article_hash: &str) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sent_articles WHERE article_hash = $1",
        )
        .bind(article_hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    pub async fn mark_article_sent(&self, article_hash: &str, title: &str, link: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sent_articles (article_hash, title, link) VALUES ($1, $2, $3) ON CONFLICT (article_hash) DO NOTHING",
        )
        .bind(article_hash)
        .bind(title)
        .bind(link)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl VoiceTimeStore for Database {
    async fn add_voice_time(&self, user_id: UserId, username: &str, seconds: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_voice_data (user_id, username, total_time)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                total_time = user_voice_data.total_time + EXCLUDED.total_time,
                username = EXCLUDED.username,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(user_id.get() as i64)
        .bind(username)
        .bind(seconds)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CommandStatusStore for Database {
    async fn fetch_status(&self, command_name: &str, guild_id: Option<GuildId>) -> Result<Option<bool>> {
        let status = sqlx::query_scalar::<_, bool>(
            "SELECT is_enabled FROM command_status WHERE command_name = $1 AND guild_id IS NOT DISTINCT FROM $2",
        )
        .bind(command_name)
        .bind(guild_id.map(|g| g.get() as i64))
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    async fn upsert_status(&self, command_name: &str, guild_id: Option<GuildId>, is_enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO command_status (command_name, guild_id, is_enabled, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (command_name, guild_id)
            DO UPDATE SET is_enabled = EXCLUDED.is_enabled, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(command_name)
        .bind(guild_id.map(|g| g.get() as i64))
        .bind(is_enabled)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_default_status(&self, command_name: &str, guild_id: Option<GuildId>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO command_status (command_name, guild_id, is_enabled, updated_at)
            VALUES ($1, $2, TRUE, $3)
            ON CONFLICT (command_name, guild_id) DO NOTHING
            "#,
        )
        .bind(command_name)
        .bind(guild_id.map(|g| g.get() as i64))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_statuses(&self, guild_id: Option<GuildId>) -> Result<Vec<(String, bool)>> {
        let rows = sqlx::query_as::<_, (String, bool)>(
            r#"
            SELECT command_name, is_enabled
            FROM command_status
            WHERE guild_id IS NULL OR guild_id = $1
            ORDER BY guild_id NULLS FIRST, command_name
            "#,
        )
        .bind(guild_id.map(|g| g.get() as i64))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
