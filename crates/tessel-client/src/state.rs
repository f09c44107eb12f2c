//! Where this peer stands with each cafe.

use chrono::{DateTime, Utc};
use serde::Serialize;

use tessel_shared::models::CafeSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    /// No session held; challenge and register.
    Unregistered,
    /// Access token usable, or refreshable with the refresh token.
    Registered,
    /// Both tokens lapsed; only a fresh registration helps.
    Expired,
}

impl SessionStatus {
    pub fn of(session: Option<&CafeSession>, now: DateTime<Utc>) -> Self {
        match session {
            None => SessionStatus::Unregistered,
            Some(s) if s.refresh_expired(now) => SessionStatus::Expired,
            Some(_) => SessionStatus::Registered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tessel_shared::models::Cafe;
    use tessel_shared::Address;

    fn session(rexp: DateTime<Utc>) -> CafeSession {
        CafeSession {
            id: "s".into(),
            access: "a".into(),
            exp: rexp,
            refresh: "r".into(),
            rexp,
            subject: Address([1u8; 32]),
            session_type: "ed25519-bearer".into(),
            cafe: Cafe {
                peer: Address([2u8; 32]),
                address: Address([2u8; 32]),
                api: "v0".into(),
                protocol: String::new(),
                node: String::new(),
                url: String::new(),
                swarm: Vec::new(),
            },
        }
    }

    #[test]
    fn test_status_follows_refresh_expiry() {
        let now = Utc::now();
        assert_eq!(SessionStatus::of(None, now), SessionStatus::Unregistered);
        let live = session(now + Duration::hours(1));
        assert_eq!(SessionStatus::of(Some(&live), now), SessionStatus::Registered);
        let lapsed = session(now - Duration::seconds(1));
        assert_eq!(SessionStatus::of(Some(&lapsed), now), SessionStatus::Expired);
    }
}
