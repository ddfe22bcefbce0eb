use std::sync::Arc;

use anyhow::Result;
use serenity::all::{Context, GuildId, RoleId, UserId};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::anime::AnimeNews;
use crate::audit::{AuditLog, VoiceEvent};
use crate::config::Config;
use crate::db::Database;

const VOICE_ROLE_CANDIDATES: i64 = 100;

/// Users from the voice ranking who reached the threshold, in ranking order.
pub fn role_candidates(ranking: &[(u64, i64)], hours: i64) -> Vec<u64> {
    let threshold = hours.saturating_mul(3600);
    ranking
        .iter()
        .filter(|(_, total)| *total >= threshold)
        .map(|(user_id, _)| *user_id)
        .collect()
}

pub async fn start_background_jobs(ctx: Arc<Context>, db: Database, config: Arc<Config>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let ctx_clone = ctx.clone();
    let db_clone = db.clone();
    let config_clone = config.clone();

    let voice_role_job = Job::new_async("0 0 * * * *", move |_uuid, _l| {
        let ctx = ctx_clone.clone();
        let db = db_clone.clone();
        let config = config_clone.clone();
        Box::pin(async move {
            tokio::spawn(async move {
                if let Err(e) = assign_voice_roles(ctx, db, config).await {
                    error!("[ROLE] Voice role job failed: {}", e);
                }
            });
        })
    })?;
    scheduler.add(voice_role_job).await?;

    match config.news_channel() {
        Some(_) => {
            let news = Arc::new(AnimeNews::new()?);
            let ctx_clone = ctx.clone();
            let db_clone = db.clone();
            let config_clone = config.clone();

            let anime_job = Job::new_async("0 30 * * * *", move |_uuid, _l| {
                let ctx = ctx_clone.clone();
                let db = db_clone.clone();
                let config = config_clone.clone();
                let news = news.clone();
                Box::pin(async move {
                    tokio::spawn(async move {
                        let Some(channel_id) = config.news_channel() else {
                            return;
                        };
                        match news.post_new_articles(&ctx.http, &db, channel_id).await {
                            Ok(sent) => info!("[ANIME] News run finished, {} article(s) posted", sent),
                            Err(e) => error!("[ANIME] News run failed: {}", e),
                        }
                    });
                })
            })?;
            scheduler.add(anime_job).await?;
        }
        None => warn!("[ANIME] No news channel configured, anime news disabled"),
    }

    scheduler.start().await?;
    info!("Background jobs started");

    Ok(scheduler)
}

async fn voice_role_id(ctx: &Context, guild_id: GuildId, role_name: &str) -> Result<Option<RoleId>> {
    let roles = guild_id.roles(&ctx.http).await?;
    Ok(roles
        .values()
        .find(|role| role.name == role_name)
        .map(|role| role.id))
}

async fn assign_voice_roles(ctx: Arc<Context>, db: Database, config: Arc<Config>) -> Result<()> {
    info!("[ROLE] Starting voice role job");

    let guild_id = config.guild_id;
    let Some(role_id) = voice_role_id(&ctx, guild_id, &config.voice_role_name).await? else {
        warn!(
            "[ROLE] Role {} not found in guild {}, skipping",
            config.voice_role_name, guild_id
        );
        return Ok(());
    };

    let ranking: Vec<(u64, i64)> = db
        .get_top_voice_users(VOICE_ROLE_CANDIDATES)
        .await?
        .into_iter()
        .map(|row| (row.user_id as u64, row.total_time))
        .collect();

    let audit = AuditLog::new(ctx.http.clone(), config.clone());
    let mut granted = 0;

    for user_id in role_candidates(&ranking, config.voice_hours_for_role) {
        if user_id == 0 {
            continue;
        }
        let user_id = UserId::new(user_id);

        let member = match guild_id.member(&*ctx, user_id).await {
            Ok(member) => member,
            Err(e) => {
                warn!("[ROLE] {} is not a member of guild {}: {}", user_id, guild_id, e);
                continue;
            }
        };
        if member.roles.contains(&role_id) {
            continue;
        }

        if let Err(e) = ctx
            .http
            .add_member_role(guild_id, user_id, role_id, Some("Voice time threshold reached"))
            .await
        {
            error!("[ROLE] Failed to give {} to {}: {}", config.voice_role_name, user_id, e);
            continue;
        }

        granted += 1;
        info!(
            "[ROLE] Gave {} to {} ({}) after {}h in voice",
            config.voice_role_name, member.user.name, user_id, config.voice_hours_for_role
        );
        audit
            .voice_event(
                VoiceEvent::RoleAssigned,
                user_id,
                &format!(
                    "received the role **{}** for reaching {} hours in voice",
                    config.voice_role_name, config.voice_hours_for_role
                ),
            )
            .await;
    }

    info!("[ROLE] Voice role job completed, {} role(s) granted", granted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_candidates_threshold_is_inclusive() {
        let ranking = vec![(1, 200 * 3600), (2, 50 * 3600), (3, 50 * 3600 - 1), (4, 0)];
        assert_eq!(role_candidates(&ranking, 50), vec![1, 2]);
    }

    #[test]
    fn test_role_candidates_zero_hours_takes_everyone() {
        let ranking = vec![(1, 10), (2, 0)];
        assert_eq!(role_candidates(&ranking, 0), vec![1, 2]);
    }
}
