//! Audience resolution
//!
//! Turns activity addressing (`to` / `cc` / `bcc`) into the concrete
//! set of remote inbox URLs a delivery should reach. Local actors are
//! skipped, follower collections expand to accepted followers, and
//! shared inboxes collapse fan-out to one request per server.

use std::collections::HashSet;

use crate::data::{ActorIdentity, Database};
use crate::error::AppError;

/// The ActivityStreams public-audience marker.
pub const PUBLIC_SENTINEL: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Addressing fields lifted from an outbound activity.
#[derive(Debug, Clone, Default)]
pub struct Addressing {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

impl Addressing {
    /// All addresses in declaration order (`to`, then `cc`, then `bcc`).
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }
}

/// Resolves addressing into deliverable inbox URLs.
#[derive(Clone)]
pub struct AudienceResolver {
    db: Database,
    base_url: String,
}

impl AudienceResolver {
    pub fn new(db: Database, base_url: String) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self { db, base_url }
    }

    fn is_local(&self, url: &str) -> bool {
        url == self.base_url || url.starts_with(&format!("{}/", self.base_url))
    }

    /// Resolve the full addressing of an activity published by `sender`.
    ///
    /// Rules, applied per address:
    /// - the public sentinel adds the sender's accepted followers
    /// - the sender's own followers collection expands the same way
    /// - local URLs are dropped (never delivered over the network)
    /// - anything else resolves through the peer actor directory
    ///
    /// The result is deduplicated; an inbox reachable through several
    /// addresses appears once.
    pub async fn resolve(
        &self,
        sender: &ActorIdentity,
        addressing: &Addressing,
    ) -> Result<Vec<String>, AppError> {
        let mut seen = HashSet::new();
        let mut inboxes = Vec::new();
        let followers_url = sender.followers_url();
        let mut followers_expanded = false;

        for address in addressing.recipients() {
            if address == PUBLIC_SENTINEL || address == followers_url {
                if !followers_expanded {
                    followers_expanded = true;
                    for inbox in self.follower_inboxes(&sender.user_id).await? {
                        if seen.insert(inbox.clone()) {
                            inboxes.push(inbox);
                        }
                    }
                }
                continue;
            }

            if self.is_local(address) {
                continue;
            }

            if let Some(inbox) = self.actor_inbox(address).await? {
                if seen.insert(inbox.clone()) {
                    inboxes.push(inbox);
                }
            } else {
                tracing::debug!(actor_url = %address, "Skipping unknown remote actor in audience");
            }
        }

        Ok(inboxes)
    }

    /// Delivery inboxes of a user's accepted followers, deduplicated.
    pub async fn follower_inboxes(&self, user_id: &str) -> Result<Vec<String>, AppError> {
        let followers = self.db.accepted_followers(user_id).await?;

        let mut seen = HashSet::new();
        let mut inboxes = Vec::new();
        for follower in &followers {
            let inbox = follower.delivery_inbox();
            if seen.insert(inbox.to_string()) {
                inboxes.push(inbox.to_string());
            }
        }
        Ok(inboxes)
    }

    /// Inbox for a single remote actor, shared inbox preferred.
    async fn actor_inbox(&self, actor_url: &str) -> Result<Option<String>, AppError> {
        let Some(peer) = self.db.get_peer_actor(actor_url).await? else {
            return Ok(None);
        };
        Ok(peer.shared_inbox_url.or(peer.inbox_url))
    }
}
