use std::collections::HashMap;

use relay_net::Token;
use tracing::debug;

use crate::session::Session;

/// Unique owner of every live session, keyed by connection token.
///
/// A session becomes findable by identity once LOGON has set one; dead
/// sessions linger (shutdown-complete) until the periodic reaper sweeps
/// them.
#[derive(Debug, Default)]
pub(crate) struct SessionManager {
    sessions: HashMap<Token, Session>,
}

impl SessionManager {
    pub(crate) fn add(&mut self, session: Session) {
        self.sessions.insert(session.token(), session);
    }

    pub(crate) fn get(&self, token: Token) -> Option<&Session> {
        self.sessions.get(&token)
    }

    pub(crate) fn get_mut(&mut self, token: Token) -> Option<&mut Session> {
        self.sessions.get_mut(&token)
    }

    /// Exact-identity lookup among logged-on sessions. Linear scan; fleets
    /// are small.
    pub(crate) fn find_token(&self, client_type: u32, client_id: u32) -> Option<Token> {
        self.sessions
            .values()
            .find(|s| {
                s.is_authenticated()
                    && !s.is_shutdown_complete()
                    && s.client_type() == client_type
                    && s.client_id() == client_id
            })
            .map(|s| s.token())
    }

    /// Sweep shutdown-complete sessions. Returns how many were removed.
    pub(crate) fn remove_dead(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_shutdown_complete());
        let removed = before - self.sessions.len();
        if removed > 0 {
            debug!(removed, "reaped dead sessions");
        }
        removed
    }

    pub(crate) fn tokens(&self) -> Vec<Token> {
        self.sessions.keys().copied().collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(token: usize) -> Session {
        Session::new(Token(token), "127.0.0.1:4000".parse().unwrap())
    }

    #[test]
    fn find_only_matches_authenticated_identities() {
        let mut mgr = SessionManager::default();
        mgr.add(session(1));
        assert_eq!(mgr.find_token(0, 0), None, "pre-logon sessions are not findable");

        mgr.get_mut(Token(1)).unwrap().set_identity(1, 100);
        assert_eq!(mgr.find_token(1, 100), Some(Token(1)));
        assert_eq!(mgr.find_token(1, 101), None);
    }

    #[test]
    fn reaper_removes_only_completed_sessions() {
        let mut mgr = SessionManager::default();
        mgr.add(session(1));
        mgr.add(session(2));
        assert_eq!(mgr.remove_dead(), 0);

        mgr.get_mut(Token(1)).unwrap().mark_shutdown_complete();
        assert_eq!(mgr.remove_dead(), 1);
        assert_eq!(mgr.len(), 1);
        assert!(mgr.get(Token(2)).is_some());
    }

    #[test]
    fn completed_sessions_are_not_findable() {
        let mut mgr = SessionManager::default();
        mgr.add(session(1));
        mgr.get_mut(Token(1)).unwrap().set_identity(2, 200);
        mgr.get_mut(Token(1)).unwrap().mark_shutdown_complete();
        assert_eq!(mgr.find_token(2, 200), None);
    }
}
