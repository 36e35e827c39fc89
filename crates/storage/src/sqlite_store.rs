use std::cell::Cell;

use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use twiiiiiter_util::{Text, UnixMicros, Username, unix_micros};

use crate::{FollowOutcome, Storage, StorageError, Twiiiiit};

const SCHEMA: &str = "
    create table if not exists users (
        name        blob primary key not null,
        last_online integer not null
    );
    create table if not exists followings (
        follower blob not null references users (name),
        followee blob not null references users (name),
        unique (follower, followee)
    );
    create table if not exists twiiiiits (
        date    integer not null,
        author  blob not null references users (name),
        message blob not null
    );
    create index if not exists twiiiiits_author_date on twiiiiits (author, date);
    create index if not exists followings_followee on followings (followee);
";

#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
    // Last timestamp handed out. Every write gets a strictly greater one, so
    // presence markers and twiiiiits are totally ordered.
    last_stamp: Cell<UnixMicros>,
}

impl SqliteStorage {
    /// Open (or create) the database at `location`. `:memory:` gives a
    /// private in-memory database.
    pub fn open(location: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(location)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        // SQLite does not check foreign keys unless asked to.
        conn.execute_batch("pragma foreign_keys = on;")?;
        conn.execute_batch(SCHEMA)?;

        let last_twiiiiit: Option<UnixMicros> =
            conn.query_row("select max(date) from twiiiiits", [], |row| row.get(0))?;
        let last_presence: Option<UnixMicros> =
            conn.query_row("select max(last_online) from users", [], |row| row.get(0))?;
        let last_stamp = last_twiiiiit.max(last_presence).unwrap_or(0);

        tracing::info!(
            version = rusqlite::version(),
            last_stamp,
            "sqlite storage ready"
        );

        Ok(Self {
            conn,
            last_stamp: Cell::new(last_stamp),
        })
    }

    fn next_stamp(&self) -> UnixMicros {
        let stamp = unix_micros().max(self.last_stamp.get() + 1);
        self.last_stamp.set(stamp);
        stamp
    }

    fn user_exists(&self, user: &Username) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "select 1 from users where name = ?1",
                params![user.as_bytes()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn list_names(&self, sql: &str, user: &Username) -> Result<Vec<Username>, StorageError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params![user.as_bytes()], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|name| Username::new(name).map_err(StorageError::from))
            .collect()
    }
}

fn constraint_outcome(err: &rusqlite::Error) -> Option<FollowOutcome> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            match e.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Some(FollowOutcome::NotFound),
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE => Some(FollowOutcome::Unchanged),
                _ => None,
            }
        }
        _ => None,
    }
}

impl Storage for SqliteStorage {
    fn record_presence(&self, user: &Username, online: bool) -> Result<UnixMicros, StorageError> {
        let now = self.next_stamp();
        self.conn.execute(
            "insert into users (name, last_online) values (?1, ?2)
             on conflict (name) do update set last_online = ?2",
            params![user.as_bytes(), now],
        )?;
        tracing::debug!(%user, online, stamp = now, "presence recorded");
        Ok(now)
    }

    fn follow(
        &self,
        follower: &Username,
        followee: &Username,
    ) -> Result<FollowOutcome, StorageError> {
        if follower == followee {
            return Ok(FollowOutcome::NotFound);
        }

        let res = self.conn.execute(
            "insert into followings (follower, followee) values (?1, ?2)",
            params![follower.as_bytes(), followee.as_bytes()],
        );

        match res {
            Ok(_) => Ok(FollowOutcome::Ok),
            Err(e) => constraint_outcome(&e).ok_or(StorageError::Sqlite(e)),
        }
    }

    fn unfollow(
        &self,
        follower: &Username,
        followee: &Username,
    ) -> Result<FollowOutcome, StorageError> {
        if follower == followee {
            return Ok(FollowOutcome::NotFound);
        }

        let changed = self.conn.execute(
            "delete from followings where follower = ?1 and followee = ?2",
            params![follower.as_bytes(), followee.as_bytes()],
        )?;

        if changed != 0 {
            Ok(FollowOutcome::Ok)
        } else if self.user_exists(followee)? {
            Ok(FollowOutcome::Unchanged)
        } else {
            Ok(FollowOutcome::NotFound)
        }
    }

    fn list_followees(&self, user: &Username) -> Result<Vec<Username>, StorageError> {
        self.list_names(
            "select followee from followings where follower = ?1 order by rowid",
            user,
        )
    }

    fn list_followers(&self, user: &Username) -> Result<Vec<Username>, StorageError> {
        self.list_names(
            "select follower from followings where followee = ?1 order by rowid",
            user,
        )
    }

    fn save_message(&self, author: &Username, text: &Text) -> Result<Twiiiiit, StorageError> {
        let date = self.next_stamp();
        self.conn.execute(
            "insert into twiiiiits (date, author, message) values (?1, ?2, ?3)",
            params![date, author.as_bytes(), text.as_bytes()],
        )?;

        Ok(Twiiiiit {
            date,
            author: *author,
            text: *text,
        })
    }

    fn list_missed_messages(&self, user: &Username) -> Result<Vec<Twiiiiit>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "select t.date, t.author, t.message
               from twiiiiits t
              inner join followings f on t.author = f.followee
              inner join users u on f.follower = u.name
              where f.follower = ?1 and t.date >= u.last_online
              order by t.date, t.rowid",
        )?;

        let rows = stmt
            .query_map(params![user.as_bytes()], |row| {
                Ok((
                    row.get::<_, UnixMicros>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(date, author, text)| {
                Ok(Twiiiiit {
                    date,
                    author: Username::new(&author)?,
                    text: Text::new(&text)?,
                })
            })
            .collect()
    }
}
