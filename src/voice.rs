use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serenity::all::{ChannelId, UserId};
use tracing::{error, info, warn};

/// Persistence for accumulated voice time.
#[async_trait]
pub trait VoiceTimeStore: Send + Sync {
    /// Adds `seconds` to the user's total, creating the row if needed.
    async fn add_voice_time(&self, user_id: UserId, username: &str, seconds: i64) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSession {
    pub channel_id: ChannelId,
    pub join_time: DateTime<Utc>,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceTransition {
    Join(ChannelId),
    Leave(ChannelId),
    Move { from: ChannelId, to: ChannelId },
}

impl VoiceTransition {
    /// Mute, deafen and stream toggles keep the channel and map to `None`.
    pub fn classify(old: Option<ChannelId>, new: Option<ChannelId>) -> Option<Self> {
        match (old, new) {
            (None, Some(to)) => Some(Self::Join(to)),
            (Some(from), None) => Some(Self::Leave(from)),
            (Some(from), Some(to)) if from != to => Some(Self::Move { from, to }),
            _ => None,
        }
    }
}

/// What closing a session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionClose {
    NoSession,
    Discarded { channel_id: ChannelId },
    Recorded { channel_id: ChannelId, seconds: i64 },
}

impl SessionClose {
    pub fn seconds(&self) -> i64 {
        match self {
            Self::Recorded { seconds, .. } => *seconds,
            _ => 0,
        }
    }
}

/// Turns join/leave/move events into accumulated connected time.
///
/// Sessions live only in memory. A restart while users sit in voice loses the
/// open interval unless [`VoiceTracker::resume`] is fed the current occupancy.
pub struct VoiceTracker {
    sessions: Mutex<HashMap<UserId, VoiceSession>>,
    store: Arc<dyn VoiceTimeStore>,
}

impl VoiceTracker {
    pub fn new(store: Arc<dyn VoiceTimeStore>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn on_join(&self, user_id: UserId, channel_id: ChannelId, username: &str, now: DateTime<Utc>) {
        let session = VoiceSession {
            channel_id,
            join_time: now,
            username: username.to_string(),
        };

        if let Some(previous) = self.sessions.lock().insert(user_id, session) {
            warn!(
                "[VOICE] User {} joined {} while a session in {} was still open, replacing it",
                user_id, channel_id, previous.channel_id
            );
        }
    }

    pub async fn on_leave(&self, user_id: UserId, now: DateTime<Utc>) -> SessionClose {
        let Some(session) = self.sessions.lock().remove(&user_id) else {
            return SessionClose::NoSession;
        };
        self.record(user_id, session, now).await
    }

    /// Closes the old segment and opens the new one with the same timestamp.
    /// The swap happens under one lock so a concurrent leave sees either
    /// session, never neither.
    pub async fn on_move(
        &self,
        user_id: UserId,
        old_channel: ChannelId,
        new_channel: ChannelId,
        username: &str,
        now: DateTime<Utc>,
    ) -> SessionClose {
        let session = VoiceSession {
            channel_id: new_channel,
            join_time: now,
            username: username.to_string(),
        };
        let previous = self.sessions.lock().insert(user_id, session);

        match previous {
            Some(previous) => self.record(user_id, previous, now).await,
            None => {
                info!(
                    "[VOICE] User {} moved {} -> {} without a tracked session, tracking from now",
                    user_id, old_channel, new_channel
                );
                SessionClose::NoSession
            }
        }
    }

    /// Persists a session that was already removed from the map.
    async fn record(&self, user_id: UserId, session: VoiceSession, now: DateTime<Utc>) -> SessionClose {
        let seconds = (now - session.join_time).num_seconds();
        if seconds <= 0 {
            warn!(
                "[VOICE] Discarding non-positive session of {}s for user {}",
                seconds, user_id
            );
            return SessionClose::Discarded {
                channel_id: session.channel_id,
            };
        }

        if let Err(e) = self
            .store
            .add_voice_time(user_id, &session.username, seconds)
            .await
        {
            error!(
                "[VOICE] Failed to persist {}s of voice time for user {}: {}",
                seconds, user_id, e
            );
            return SessionClose::Discarded {
                channel_id: session.channel_id,
            };
        }

        info!(
            "[VOICE] Recorded {}s for {} ({}) in channel {}",
            seconds, session.username, user_id, session.channel_id
        );

        SessionClose::Recorded {
            channel_id: session.channel_id,
            seconds,
        }
    }

    /// Opens sessions for users already connected, without replacing any.
    pub fn resume(&self, occupants: impl IntoIterator<Item = (UserId, ChannelId, String)>, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock();
        let mut resumed = 0;
        for (user_id, channel_id, username) in occupants {
            sessions.entry(user_id).or_insert_with(|| {
                resumed += 1;
                VoiceSession {
                    channel_id,
                    join_time: now,
                    username,
                }
            });
        }
        resumed
    }

    pub fn session(&self, user_id: UserId) -> Option<VoiceSession> {
        self.sessions.lock().get(&user_id).cloned()
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// `3725` -> `"1h 2m 5s"`.
pub fn format_duration(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{}h {}m {}s", hours, minutes, seconds)
}
