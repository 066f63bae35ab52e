//! Offline fallbacks for channel and reaction calls.
//!
//! Each handler substitutes a locally satisfied result, backed by the
//! repository, when the call failed because the network is unavailable.
//! Server rejections and other failures pass through untouched.

use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{
    ChatError, Environment,
    message::SyncStatus,
    model::{Channel, Reaction},
};
use tracing::{debug, warn};

use super::{Call, CallOutput, ErrorHandler};
use crate::repository::MessageRepository;

/// Priority shared by the offline handlers.
pub const OFFLINE_PRIORITY: i32 = 100;

/// All offline handlers over one repository.
pub fn offline_handlers<E: Environment>(
    repository: Arc<dyn MessageRepository>,
    env: E,
) -> Vec<Arc<dyn ErrorHandler>> {
    let create: Arc<dyn ErrorHandler> =
        Arc::new(CreateChannelOffline { repository: Arc::clone(&repository) });
    let react: Arc<dyn ErrorHandler> =
        Arc::new(SendReactionOffline { repository: Arc::clone(&repository) });
    let unreact: Arc<dyn ErrorHandler> =
        Arc::new(DeleteReactionOffline { repository: Arc::clone(&repository), env });
    let members: Arc<dyn ErrorHandler> = Arc::new(QueryMembersOffline { repository });
    vec![create, react, unreact, members]
}

/// Returns the cached channel, or creates it locally as `SyncNeeded`.
pub struct CreateChannelOffline {
    repository: Arc<dyn MessageRepository>,
}

#[async_trait]
impl ErrorHandler for CreateChannelOffline {
    fn name(&self) -> &'static str {
        "offline.create_channel"
    }

    fn priority(&self) -> i32 {
        OFFLINE_PRIORITY
    }

    async fn on_error(&self, call: &Call, error: &ChatError) -> Option<CallOutput> {
        let Call::CreateChannel { cid, member_ids } = call else { return None };
        if !error.is_network() {
            return None;
        }

        let result = match self.repository.select_channel(cid) {
            Ok(Some(cached)) => Ok(cached),
            Ok(None) => {
                let channel = Channel::local(cid.clone(), member_ids.clone());
                self.repository.insert_channel(&channel).map(|()| channel)
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(channel) => {
                debug!(%cid, "channel served offline");
                Some(CallOutput::Channel(channel))
            },
            Err(e) => {
                warn!(%cid, error = %e, "offline channel lookup failed");
                None
            },
        }
    }
}

/// Keeps the reaction locally as `SyncNeeded`.
pub struct SendReactionOffline {
    repository: Arc<dyn MessageRepository>,
}

#[async_trait]
impl ErrorHandler for SendReactionOffline {
    fn name(&self) -> &'static str {
        "offline.send_reaction"
    }

    fn priority(&self) -> i32 {
        OFFLINE_PRIORITY
    }

    async fn on_error(&self, call: &Call, error: &ChatError) -> Option<CallOutput> {
        let Call::SendReaction(reaction) = call else { return None };
        if !error.is_network() {
            return None;
        }

        let mut reaction = reaction.clone();
        reaction.sync_status = SyncStatus::SyncNeeded;
        reaction.deleted_at = None;
        store_reaction(self.repository.as_ref(), reaction)
    }
}

/// Records the deletion locally as `SyncNeeded`.
pub struct DeleteReactionOffline<E> {
    repository: Arc<dyn MessageRepository>,
    env: E,
}

#[async_trait]
impl<E: Environment> ErrorHandler for DeleteReactionOffline<E> {
    fn name(&self) -> &'static str {
        "offline.delete_reaction"
    }

    fn priority(&self) -> i32 {
        OFFLINE_PRIORITY
    }

    async fn on_error(&self, call: &Call, error: &ChatError) -> Option<CallOutput> {
        let Call::DeleteReaction { message_id, user_id, kind } = call else { return None };
        if !error.is_network() {
            return None;
        }

        let existing = match self.repository.select_reactions(message_id) {
            Ok(reactions) => {
                reactions.into_iter().find(|r| &r.user_id == user_id && &r.kind == kind)
            },
            Err(e) => {
                warn!(%message_id, error = %e, "offline reaction lookup failed");
                return None;
            },
        };

        let mut reaction =
            existing.unwrap_or_else(|| Reaction::new(message_id.clone(), user_id.clone(), kind.clone()));
        reaction.deleted_at = Some(self.env.wall_clock_millis());
        reaction.sync_status = SyncStatus::SyncNeeded;
        store_reaction(self.repository.as_ref(), reaction)
    }
}

/// Serves cached members of a known channel.
pub struct QueryMembersOffline {
    repository: Arc<dyn MessageRepository>,
}

#[async_trait]
impl ErrorHandler for QueryMembersOffline {
    fn name(&self) -> &'static str {
        "offline.query_members"
    }

    fn priority(&self) -> i32 {
        OFFLINE_PRIORITY
    }

    async fn on_error(&self, call: &Call, error: &ChatError) -> Option<CallOutput> {
        let Call::QueryMembers { cid, offset, limit } = call else { return None };
        if !error.is_network() {
            return None;
        }

        // Unknown channel: nothing trustworthy to serve.
        match self.repository.select_channel(cid) {
            Ok(Some(_)) => {},
            Ok(None) => return None,
            Err(e) => {
                warn!(%cid, error = %e, "offline channel lookup failed");
                return None;
            },
        }

        match self.repository.select_members(cid) {
            Ok(members) => Some(CallOutput::Members(
                members.into_iter().skip(*offset).take(*limit).collect(),
            )),
            Err(e) => {
                warn!(%cid, error = %e, "offline member lookup failed");
                None
            },
        }
    }
}

fn store_reaction(repository: &dyn MessageRepository, reaction: Reaction) -> Option<CallOutput> {
    match repository.insert_reaction(&reaction) {
        Ok(()) => Some(CallOutput::Reaction(reaction)),
        Err(e) => {
            warn!(message_id = %reaction.message_id, error = %e, "storing offline reaction failed");
            None
        },
    }
}
