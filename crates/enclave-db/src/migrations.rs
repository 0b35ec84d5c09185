use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            password_hash   TEXT NOT NULL,
            created_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS realms (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            visibility  TEXT NOT NULL DEFAULT 'private',
            encrypted   INTEGER NOT NULL DEFAULT 0,
            -- One-way hash of the realm key; the raw key is never stored.
            key_hash    TEXT,
            key_salt    TEXT,
            created_by  TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS realm_members (
            realm_id    TEXT NOT NULL REFERENCES realms(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            role        TEXT NOT NULL DEFAULT 'member',
            joined_at   TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(realm_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_members_user
            ON realm_members(user_id);

        CREATE TABLE IF NOT EXISTS channels (
            id              TEXT PRIMARY KEY,
            realm_id        TEXT NOT NULL REFERENCES realms(id),
            name            TEXT NOT NULL,
            encrypted       INTEGER NOT NULL DEFAULT 0,
            encrypted_at    TEXT,
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(realm_id, name)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id                  TEXT PRIMARY KEY,
            channel_id          TEXT NOT NULL REFERENCES channels(id),
            -- Root message id of the thread this reply lives in, if any.
            thread_id           TEXT,
            author_id           TEXT NOT NULL REFERENCES users(id),
            content             TEXT NOT NULL,
            encrypted           INTEGER NOT NULL DEFAULT 0,
            encryption_metadata TEXT,
            created_at          TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_channel
            ON messages(channel_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_thread
            ON messages(thread_id, created_at);

        CREATE TABLE IF NOT EXISTS direct_messages (
            id                  TEXT PRIMARY KEY,
            sender_id           TEXT NOT NULL REFERENCES users(id),
            recipient_id        TEXT NOT NULL REFERENCES users(id),
            content             TEXT NOT NULL,
            encrypted           INTEGER NOT NULL DEFAULT 0,
            encryption_metadata TEXT,
            created_at          TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS invitations (
            id          TEXT PRIMARY KEY,
            realm_id    TEXT NOT NULL REFERENCES realms(id),
            code        TEXT NOT NULL UNIQUE,
            created_by  TEXT NOT NULL REFERENCES users(id),
            max_uses    INTEGER,
            uses_count  INTEGER NOT NULL DEFAULT 0,
            expires_at  TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS invitation_uses (
            id              TEXT PRIMARY KEY,
            invitation_id   TEXT NOT NULL REFERENCES invitations(id),
            user_id         TEXT NOT NULL REFERENCES users(id),
            used_at         TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Append-only minting log; the cooldown check reads the latest row
        -- per (user, realm).
        CREATE TABLE IF NOT EXISTS invitation_mints (
            user_id     TEXT NOT NULL REFERENCES users(id),
            realm_id    TEXT NOT NULL REFERENCES realms(id),
            minted_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_mints_user_realm
            ON invitation_mints(user_id, realm_id, minted_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
