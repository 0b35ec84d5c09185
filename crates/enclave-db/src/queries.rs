use crate::Database;
use crate::models::{ChannelRow, InvitationRow, MessageRow, RealmRow, UserRow};
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password_hash) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user(conn, "SELECT id, username, password_hash, created_at FROM users WHERE username = ?1", username)
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user(conn, "SELECT id, username, password_hash, created_at FROM users WHERE id = ?1", id)
        })
    }

    // -- Realms & membership --

    #[allow(clippy::too_many_arguments)]
    pub fn create_realm(
        &self,
        id: &str,
        name: &str,
        visibility: &str,
        encrypted: bool,
        key_hash: Option<&str>,
        key_salt: Option<&str>,
        created_by: &str,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO realms (id, name, visibility, encrypted, key_hash, key_salt, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![id, name, visibility, encrypted, key_hash, key_salt, created_by, created_at],
            )?;
            Ok(())
        })
    }

    pub fn get_realm(&self, id: &str) -> Result<Option<RealmRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, visibility, encrypted, key_hash, key_salt, created_by, created_at
                 FROM realms WHERE id = ?1",
            )?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(RealmRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        visibility: row.get(2)?,
                        encrypted: row.get(3)?,
                        key_hash: row.get(4)?,
                        key_salt: row.get(5)?,
                        created_by: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    /// Creates a realm and its owner membership in one transaction.
    pub fn create_realm_with_owner(
        &self,
        id: &str,
        name: &str,
        visibility: &str,
        encrypted: bool,
        key_hash: Option<&str>,
        key_salt: Option<&str>,
        created_by: &str,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO realms (id, name, visibility, encrypted, key_hash, key_salt, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![id, name, visibility, encrypted, key_hash, key_salt, created_by, created_at],
            )?;
            tx.execute(
                "INSERT INTO realm_members (realm_id, user_id, role, joined_at) VALUES (?1, ?2, 'owner', ?3)",
                (id, created_by, created_at),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn add_realm_member(
        &self,
        realm_id: &str,
        user_id: &str,
        role: &str,
        joined_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO realm_members (realm_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)",
                (realm_id, user_id, role, joined_at),
            )?;
            Ok(())
        })
    }

    pub fn is_realm_member(&self, realm_id: &str, user_id: &str) -> Result<bool> {
        Ok(self.get_member_role(realm_id, user_id)?.is_some())
    }

    pub fn get_member_role(&self, realm_id: &str, user_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let role = conn
                .query_row(
                    "SELECT role FROM realm_members WHERE realm_id = ?1 AND user_id = ?2",
                    [realm_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(role)
        })
    }

    // -- Channels --

    pub fn create_channel(
        &self,
        id: &str,
        realm_id: &str,
        name: &str,
        encrypted: bool,
        encrypted_at: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO channels (id, realm_id, name, encrypted, encrypted_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, realm_id, name, encrypted, encrypted_at, created_at],
            )?;
            Ok(())
        })
    }

    pub fn channel_name_taken(&self, realm_id: &str, name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM channels WHERE realm_id = ?1 AND name = ?2",
                [realm_id, name],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn get_channel(&self, id: &str) -> Result<Option<ChannelRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, realm_id, name, encrypted, encrypted_at, created_at
                 FROM channels WHERE id = ?1",
            )?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(ChannelRow {
                        id: row.get(0)?,
                        realm_id: row.get(1)?,
                        name: row.get(2)?,
                        encrypted: row.get(3)?,
                        encrypted_at: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    // -- Messages --

    #[allow(clippy::too_many_arguments)]
    pub fn insert_message(
        &self,
        id: &str,
        channel_id: &str,
        thread_id: Option<&str>,
        author_id: &str,
        content: &str,
        encrypted: bool,
        encryption_metadata: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (id, channel_id, thread_id, author_id, content, encrypted, encryption_metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![id, channel_id, thread_id, author_id, content, encrypted, encryption_metadata, created_at],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.channel_id, m.thread_id, m.author_id, u.username, m.content,
                        m.encrypted, m.encryption_metadata, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.author_id = u.id
                 WHERE m.id = ?1",
            )?;
            let row = stmt.query_row([id], map_message_row).optional()?;
            Ok(row)
        })
    }

    /// Messages of a thread in chronological order, for the join snapshot.
    pub fn get_thread_messages(&self, thread_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.channel_id, m.thread_id, m.author_id, u.username, m.content,
                        m.encrypted, m.encryption_metadata, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.author_id = u.id
                 WHERE m.thread_id = ?1
                 ORDER BY m.created_at ASC
                 LIMIT ?2",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![thread_id, limit], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_direct_message(
        &self,
        id: &str,
        sender_id: &str,
        recipient_id: &str,
        content: &str,
        encrypted: bool,
        encryption_metadata: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO direct_messages (id, sender_id, recipient_id, content, encrypted, encryption_metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![id, sender_id, recipient_id, content, encrypted, encryption_metadata, created_at],
            )?;
            Ok(())
        })
    }

    // -- Invitations --

    #[allow(clippy::too_many_arguments)]
    pub fn insert_invitation(
        &self,
        id: &str,
        realm_id: &str,
        code: &str,
        created_by: &str,
        max_uses: Option<u32>,
        expires_at: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO invitations (id, realm_id, code, created_by, max_uses, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![id, realm_id, code, created_by, max_uses, expires_at, created_at],
            )?;
            Ok(())
        })
    }

    /// Insert an invitation together with its minting record. One
    /// transaction, so a failed insert never burns the minter's cooldown.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_invitation_minted(
        &self,
        id: &str,
        realm_id: &str,
        code: &str,
        created_by: &str,
        max_uses: Option<u32>,
        expires_at: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO invitations (id, realm_id, code, created_by, max_uses, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![id, realm_id, code, created_by, max_uses, expires_at, created_at],
            )?;
            tx.execute(
                "INSERT INTO invitation_mints (user_id, realm_id, minted_at) VALUES (?1, ?2, ?3)",
                (created_by, realm_id, created_at),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_invitation_by_code(&self, code: &str) -> Result<Option<InvitationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, realm_id, code, created_by, max_uses, uses_count, expires_at, created_at
                 FROM invitations WHERE code = ?1",
            )?;
            let row = stmt
                .query_row([code], |row| {
                    Ok(InvitationRow {
                        id: row.get(0)?,
                        realm_id: row.get(1)?,
                        code: row.get(2)?,
                        created_by: row.get(3)?,
                        max_uses: row.get(4)?,
                        uses_count: row.get(5)?,
                        expires_at: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    pub fn invitation_code_taken(&self, code: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM invitations WHERE code = ?1",
                [code],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Atomically consume one invitation use and add the member.
    ///
    /// The increment-and-check UPDATE and the membership/usage inserts run
    /// in one transaction: either the user is a member AND a use is
    /// recorded, or neither. Returns false when the use cap was hit (a
    /// concurrent joiner won the race).
    pub fn consume_invitation(
        &self,
        invitation_id: &str,
        realm_id: &str,
        user_id: &str,
        use_id: &str,
        now: &str,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let updated = tx.execute(
                "UPDATE invitations SET uses_count = uses_count + 1
                 WHERE id = ?1 AND (max_uses IS NULL OR uses_count < max_uses)",
                [invitation_id],
            )?;
            if updated == 0 {
                // Exhausted; dropping the transaction rolls back.
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO realm_members (realm_id, user_id, role, joined_at)
                 VALUES (?1, ?2, 'member', ?3)",
                (realm_id, user_id, now),
            )?;
            tx.execute(
                "INSERT INTO invitation_uses (id, invitation_id, user_id, used_at)
                 VALUES (?1, ?2, ?3, ?4)",
                (use_id, invitation_id, user_id, now),
            )?;

            tx.commit()?;
            Ok(true)
        })
    }

    pub fn latest_mint(&self, user_id: &str, realm_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let minted_at = conn
                .query_row(
                    "SELECT minted_at FROM invitation_mints
                     WHERE user_id = ?1 AND realm_id = ?2
                     ORDER BY minted_at DESC LIMIT 1",
                    [user_id, realm_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(minted_at)
        })
    }

}

fn query_user(conn: &Connection, sql: &str, param: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(sql)?;

    let row = stmt
        .query_row([param], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password_hash: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        thread_id: row.get(2)?,
        author_id: row.get(3)?,
        author_username: row
            .get::<_, Option<String>>(4)?
            .unwrap_or_else(|| "unknown".to_string()),
        content: row.get(5)?,
        encrypted: row.get(6)?,
        encryption_metadata: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn seed(db: &Database) {
        db.create_user("u1", "ada", "hash1").unwrap();
        db.create_user("u2", "grace", "hash2").unwrap();
        db.create_realm(
            "r1",
            "rust circle",
            "private",
            false,
            None,
            None,
            "u1",
            "2026-08-01T00:00:00Z",
        )
        .unwrap();
        db.add_realm_member("r1", "u1", "owner", "2026-08-01T00:00:00Z")
            .unwrap();
        db.create_channel("c1", "r1", "general", false, None, "2026-08-01T00:00:00Z")
            .unwrap();
    }

    #[test]
    fn user_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);

        let user = db.get_user_by_username("ada").unwrap().unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.password_hash, "hash1");
        assert!(db.get_user_by_username("nobody").unwrap().is_none());
        assert_eq!(db.get_user_by_id("u2").unwrap().unwrap().username, "grace");
    }

    #[test]
    fn membership_and_roles() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);

        assert!(db.is_realm_member("r1", "u1").unwrap());
        assert!(!db.is_realm_member("r1", "u2").unwrap());
        assert_eq!(db.get_member_role("r1", "u1").unwrap().unwrap(), "owner");

        db.add_realm_member("r1", "u2", "member", "2026-08-02T00:00:00Z")
            .unwrap();
        assert_eq!(db.get_member_role("r1", "u2").unwrap().unwrap(), "member");

        // Duplicate membership trips the unique constraint.
        assert!(
            db.add_realm_member("r1", "u2", "member", "2026-08-02T00:00:00Z")
                .is_err()
        );
    }

    #[test]
    fn encrypted_channel_flag_persists() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);

        db.create_channel(
            "c2",
            "r1",
            "war-room",
            true,
            Some("2026-08-01T12:00:00Z"),
            "2026-08-01T12:00:00Z",
        )
        .unwrap();

        assert!(db.get_channel("c2").unwrap().unwrap().encrypted);
        assert!(!db.get_channel("c1").unwrap().unwrap().encrypted);
    }

    #[test]
    fn thread_snapshot_is_chronological() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);

        db.insert_message("m1", "c1", None, "u1", "root", false, None, "2026-08-01T10:00:00Z")
            .unwrap();
        db.insert_message("m2", "c1", Some("m1"), "u1", "first reply", false, None, "2026-08-01T10:01:00Z")
            .unwrap();
        db.insert_message("m3", "c1", Some("m1"), "u2", "second reply", false, None, "2026-08-01T10:02:00Z")
            .unwrap();
        db.insert_message("m4", "c1", None, "u2", "unrelated", false, None, "2026-08-01T10:03:00Z")
            .unwrap();

        let thread = db.get_thread_messages("m1", 100).unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].content, "first reply");
        assert_eq!(thread[1].content, "second reply");
        assert_eq!(thread[1].author_username, "grace");
    }

    #[test]
    fn invitation_consumption_is_capped() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);
        db.insert_invitation("i1", "r1", "CODE1234", "u1", Some(1), None, "2026-08-01T00:00:00Z")
            .unwrap();

        assert!(
            db.consume_invitation("i1", "r1", "u2", "use1", "2026-08-02T00:00:00Z")
                .unwrap()
        );
        db.create_user("u3", "lin", "hash3").unwrap();
        assert!(
            !db.consume_invitation("i1", "r1", "u3", "use2", "2026-08-02T00:01:00Z")
                .unwrap()
        );

        let invite = db.get_invitation_by_code("CODE1234").unwrap().unwrap();
        assert_eq!(invite.uses_count, 1);
        assert!(db.is_realm_member("r1", "u2").unwrap());
        assert!(!db.is_realm_member("r1", "u3").unwrap());
    }

    #[test]
    fn concurrent_consumption_admits_exactly_one() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        seed(&db);
        db.insert_invitation("i1", "r1", "RACE2345", "u1", Some(1), None, "2026-08-01T00:00:00Z")
            .unwrap();

        let joiners: Vec<String> = (0..8).map(|i| format!("joiner{i}")).collect();
        for j in &joiners {
            db.create_user(j, &format!("user-{j}"), "hash").unwrap();
        }

        let mut handles = Vec::new();
        for j in joiners {
            let db = db.clone();
            handles.push(std::thread::spawn(move || {
                db.consume_invitation("i1", "r1", &j, &format!("use-{j}"), "2026-08-02T00:00:00Z")
                    .unwrap()
            }));
        }

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);

        let invite = db.get_invitation_by_code("RACE2345").unwrap().unwrap();
        assert_eq!(invite.uses_count, 1);
    }

    #[test]
    fn failed_membership_insert_rolls_back_the_use() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);
        db.insert_invitation("i1", "r1", "ROLLBACK1", "u1", Some(5), None, "2026-08-01T00:00:00Z")
            .unwrap();

        // u1 is already a member: the INSERT violates the unique constraint
        // and the whole transaction, including the counter bump, rolls back.
        assert!(
            db.consume_invitation("i1", "r1", "u1", "use1", "2026-08-02T00:00:00Z")
                .is_err()
        );
        let invite = db.get_invitation_by_code("ROLLBACK1").unwrap().unwrap();
        assert_eq!(invite.uses_count, 0);
    }

    #[test]
    fn latest_mint_wins() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);

        assert!(db.latest_mint("u1", "r1").unwrap().is_none());
        db.insert_invitation_minted("i1", "r1", "MINT0001", "u1", None, None, "2026-01-01T00:00:00Z")
            .unwrap();
        db.insert_invitation_minted("i2", "r1", "MINT0002", "u1", None, None, "2026-06-01T00:00:00Z")
            .unwrap();

        assert_eq!(
            db.latest_mint("u1", "r1").unwrap().unwrap(),
            "2026-06-01T00:00:00Z"
        );
        // Scoped per (user, realm).
        assert!(db.latest_mint("u2", "r1").unwrap().is_none());
    }
}
