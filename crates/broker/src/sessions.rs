use std::collections::HashMap;
use std::fmt;

use twiiiiiter_util::Username;

/// Identity of a live connection, stable for its whole lifetime and never
/// reused while the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub usize);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("connection is not registered")]
    UnknownConnection,

    #[error("connection is already bound to {0}")]
    AlreadyBound(Username),

    #[error("username is bound to connection {0}")]
    NameInUse(ConnId),
}

/// Live connections and the usernames bound to them.
///
/// Primary index by connection, secondary index by username; a username maps
/// to at most one connection at a time.
#[derive(Debug, Default)]
pub struct SessionTable {
    by_conn: HashMap<ConnId, Option<Username>>,
    by_name: HashMap<Username, ConnId>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted, unauthenticated connection.
    pub fn insert(&mut self, conn: ConnId) -> bool {
        if self.by_conn.contains_key(&conn) {
            return false;
        }
        self.by_conn.insert(conn, None);
        true
    }

    /// Bind `name` to `conn`. A connection is bound at most once.
    pub fn bind(&mut self, conn: ConnId, name: Username) -> Result<(), BindError> {
        let slot = self
            .by_conn
            .get_mut(&conn)
            .ok_or(BindError::UnknownConnection)?;

        if let Some(bound) = slot {
            return Err(BindError::AlreadyBound(*bound));
        }
        if let Some(owner) = self.by_name.get(&name) {
            return Err(BindError::NameInUse(*owner));
        }

        *slot = Some(name);
        self.by_name.insert(name, conn);
        Ok(())
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.by_conn.contains_key(&conn)
    }

    /// Username bound to `conn`, if it is authenticated.
    pub fn username(&self, conn: ConnId) -> Option<Username> {
        self.by_conn.get(&conn).copied().flatten()
    }

    /// Connection currently bound to `name`.
    pub fn lookup(&self, name: &Username) -> Option<ConnId> {
        self.by_name.get(name).copied()
    }

    /// Forget `conn`. Returns the username it was bound to.
    pub fn remove(&mut self, conn: ConnId) -> Option<Username> {
        let name = self.by_conn.remove(&conn).flatten()?;
        self.by_name.remove(&name);
        Some(name)
    }

    /// Every authenticated connection with its username.
    pub fn authenticated(&self) -> impl Iterator<Item = (ConnId, Username)> + '_ {
        self.by_name.iter().map(|(name, conn)| (*conn, *name))
    }

    pub fn len(&self) -> usize {
        self.by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_conn.is_empty()
    }

    pub fn authenticated_len(&self) -> usize {
        self.by_name.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Username {
        Username::try_from(s).unwrap()
    }

    #[test]
    fn bind_then_lookup_both_ways() {
        let mut table = SessionTable::new();
        assert!(table.insert(ConnId(1)));
        assert_eq!(table.username(ConnId(1)), None);

        table.bind(ConnId(1), name("Bob")).unwrap();
        assert_eq!(table.username(ConnId(1)), Some(name("Bob")));
        assert_eq!(table.lookup(&name("Bob")), Some(ConnId(1)));
        assert_eq!(table.authenticated_len(), 1);
    }

    #[test]
    fn a_name_belongs_to_one_connection() {
        let mut table = SessionTable::new();
        table.insert(ConnId(1));
        table.insert(ConnId(2));
        table.bind(ConnId(1), name("Bob")).unwrap();

        assert_eq!(
            table.bind(ConnId(2), name("Bob")),
            Err(BindError::NameInUse(ConnId(1)))
        );
        assert_eq!(table.username(ConnId(2)), None);
    }

    #[test]
    fn a_connection_binds_once() {
        let mut table = SessionTable::new();
        table.insert(ConnId(1));
        table.bind(ConnId(1), name("Bob")).unwrap();

        assert_eq!(
            table.bind(ConnId(1), name("Alice")),
            Err(BindError::AlreadyBound(name("Bob")))
        );
        assert_eq!(table.lookup(&name("Alice")), None);
    }

    #[test]
    fn unknown_connections_cannot_bind() {
        let mut table = SessionTable::new();
        assert_eq!(
            table.bind(ConnId(9), name("Bob")),
            Err(BindError::UnknownConnection)
        );
    }

    #[test]
    fn remove_frees_the_name() {
        let mut table = SessionTable::new();
        table.insert(ConnId(1));
        table.insert(ConnId(2));
        table.bind(ConnId(1), name("Bob")).unwrap();

        assert_eq!(table.remove(ConnId(1)), Some(name("Bob")));
        assert!(!table.contains(ConnId(1)));
        assert_eq!(table.lookup(&name("Bob")), None);
        table.bind(ConnId(2), name("Bob")).unwrap();

        assert_eq!(table.remove(ConnId(3)), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn removing_unauthenticated_connection_returns_none() {
        let mut table = SessionTable::new();
        table.insert(ConnId(4));
        assert_eq!(table.remove(ConnId(4)), None);
        assert!(table.is_empty());
    }
}
