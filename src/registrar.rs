// SIP user accounts, location bindings and the number blocklist

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{Error, Result, SipUri};

// A provisioned SIP account. `ha1` is MD5(user:realm:pass); the clear
// password is never stored.
#[derive(Debug, Clone, Serialize)]
pub struct SipUser {
    pub username: String,
    pub realm: String,
    #[serde(skip_serializing)]
    pub ha1: String,
    pub active: bool,
    pub blocked: bool,
    pub max_concurrent_calls: u32,
    pub failed_auth_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl SipUser {
    pub fn new(username: &str, realm: &str, ha1: &str) -> Self {
        SipUser {
            username: username.to_string(),
            realm: realm.to_string(),
            ha1: ha1.to_string(),
            active: true,
            blocked: false,
            max_concurrent_calls: 3,
            failed_auth_attempts: 0,
            locked_until: None,
            last_seen: None,
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map(|until| until > now).unwrap_or(false)
    }

    /// Whether this account may originate or register right now.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.blocked && !self.is_locked(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials matched.
    Ok,
    /// Credentials wrong; challenge again.
    Failed,
    /// Account is locked out (or blocked): 403, no fresh challenge.
    Locked,
    /// No such account.
    UnknownUser,
}

// Process-wide account store. The admin API mutates this through the same
// methods; relational persistence stays outside the process.
pub struct UserStore {
    users: RwLock<HashMap<String, SipUser>>,
    max_failed_attempts: u32,
    lockout: Duration,
}

impl UserStore {
    pub fn new(max_failed_attempts: u32, lockout_secs: i64) -> Self {
        UserStore {
            users: RwLock::new(HashMap::new()),
            max_failed_attempts,
            lockout: Duration::seconds(lockout_secs),
        }
    }

    pub async fn upsert(&self, user: SipUser) {
        self.users.write().await.insert(user.username.clone(), user);
    }

    pub async fn remove(&self, username: &str) -> bool {
        self.users.write().await.remove(username).is_some()
    }

    pub async fn get(&self, username: &str) -> Option<SipUser> {
        self.users.read().await.get(username).cloned()
    }

    pub async fn list(&self) -> Vec<SipUser> {
        self.users.read().await.values().cloned().collect()
    }

    /// Record a failed digest attempt, locking the account when the limit
    /// is reached.
    pub async fn record_auth_failure(&self, username: &str) -> AuthOutcome {
        let mut users = self.users.write().await;
        let user = match users.get_mut(username) {
            Some(u) => u,
            None => return AuthOutcome::UnknownUser,
        };
        let now = Utc::now();
        if user.is_locked(now) {
            return AuthOutcome::Locked;
        }

        user.failed_auth_attempts += 1;
        if user.failed_auth_attempts >= self.max_failed_attempts {
            user.locked_until = Some(now + self.lockout);
            warn!(
                username,
                attempts = user.failed_auth_attempts,
                "account locked after repeated auth failures"
            );
        }
        AuthOutcome::Failed
    }

    /// Record a successful authentication: the failure counter resets and
    /// last_seen moves forward.
    pub async fn record_auth_success(&self, username: &str) {
        let mut users = self.users.write().await;
        if let Some(user) = users.get_mut(username) {
            user.failed_auth_attempts = 0;
            user.locked_until = None;
            user.last_seen = Some(Utc::now());
        }
    }

    /// Gate check before even looking at credentials.
    pub async fn admission(&self, username: &str) -> AuthOutcome {
        let users = self.users.read().await;
        match users.get(username) {
            None => AuthOutcome::UnknownUser,
            Some(user) if !user.is_usable(Utc::now()) => AuthOutcome::Locked,
            Some(_) => AuthOutcome::Ok,
        }
    }
}

// Registrar location bindings
#[derive(Debug, Clone, Serialize)]
pub struct Binding {
    pub contact_uri: String,
    pub expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub received_ip: IpAddr,
}

pub struct LocationStore {
    bindings: RwLock<HashMap<String, Vec<Binding>>>,
}

impl Default for LocationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationStore {
    pub fn new() -> Self {
        LocationStore {
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Apply one REGISTER contact. `expires_secs == 0` removes the binding.
    /// Returns the AOR's current bindings.
    pub async fn update(
        &self,
        aor: &str,
        contact_uri: &str,
        expires_secs: u32,
        user_agent: Option<String>,
        received_ip: IpAddr,
    ) -> Vec<Binding> {
        let mut map = self.bindings.write().await;
        let entry = map.entry(aor.to_string()).or_default();
        let now = Utc::now();
        entry.retain(|b| b.expires_at > now && b.contact_uri != contact_uri);

        if expires_secs > 0 {
            entry.push(Binding {
                contact_uri: contact_uri.to_string(),
                expires_at: now + Duration::seconds(expires_secs as i64),
                user_agent,
                received_ip,
            });
            info!(aor, contact = contact_uri, expires = expires_secs, "binding refreshed");
        } else {
            debug!(aor, contact = contact_uri, "binding removed");
        }

        let current = entry.clone();
        if entry.is_empty() {
            map.remove(aor);
        }
        current
    }

    /// Remove every binding for the AOR (`Contact: *` with `Expires: 0`).
    pub async fn clear(&self, aor: &str) {
        self.bindings.write().await.remove(aor);
    }

    /// Unexpired bindings for the AOR, freshest first.
    pub async fn lookup(&self, aor: &str) -> Vec<Binding> {
        let map = self.bindings.read().await;
        let now = Utc::now();
        let mut found: Vec<Binding> = map
            .get(aor)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|b| b.expires_at > now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by(|a, b| b.expires_at.cmp(&a.expires_at));
        found
    }

    pub async fn contact_for(&self, aor: &str) -> Option<SipUri> {
        self.lookup(aor)
            .await
            .first()
            .and_then(|b| SipUri::parse(&b.contact_uri).ok())
    }

    /// Drop expired bindings; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut map = self.bindings.write().await;
        let now = Utc::now();
        let mut removed = 0;
        map.retain(|_, bindings| {
            let before = bindings.len();
            bindings.retain(|b| b.expires_at > now);
            removed += before - bindings.len();
            !bindings.is_empty()
        });
        removed
    }
}

// Blocked caller/callee numbers, exact-match on the user part
pub struct BlockedNumbers {
    numbers: RwLock<HashSet<String>>,
}

impl Default for BlockedNumbers {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockedNumbers {
    pub fn new() -> Self {
        BlockedNumbers {
            numbers: RwLock::new(HashSet::new()),
        }
    }

    pub async fn block(&self, number: &str) {
        self.numbers.write().await.insert(number.to_string());
    }

    pub async fn unblock(&self, number: &str) -> bool {
        self.numbers.write().await.remove(number)
    }

    pub async fn is_blocked(&self, number: &str) -> bool {
        self.numbers.read().await.contains(number)
    }

    pub async fn check(&self, number: &str) -> Result<()> {
        if self.is_blocked(number).await {
            return Err(Error::Policy(format!("number {} is blocked", number)));
        }
        Ok(())
    }
}
