use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Error};
use cdp_api_types::Metadata;
use rusqlite::{params, Connection, OptionalExtension};

/// Persistent key/value store remembering which metadata records have
/// already been fully transmitted, and buffering requests that failed to
/// send while the server was unreachable (§4.3, §6.3).
///
/// All mutating operations serialize through `conn`'s mutex (§5, "single
/// writer"); SQLite itself additionally serializes writers at the file
/// level, so this is belt-and-suspenders rather than the only thing
/// preventing corruption.
pub struct LocalCache {
    conn: Mutex<Connection>,
}

impl LocalCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("unable to open local cache {path:?}"))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS files (
                file_id     INTEGER PRIMARY KEY,
                cache_time  INTEGER NOT NULL,
                type        TEXT NOT NULL,
                inode       INTEGER NOT NULL,
                file_user   TEXT NOT NULL,
                file_group  TEXT NOT NULL,
                uid         INTEGER NOT NULL,
                gid         INTEGER NOT NULL,
                atime       INTEGER NOT NULL,
                ctime       INTEGER NOT NULL,
                mtime       INTEGER NOT NULL,
                mode        INTEGER NOT NULL,
                size        INTEGER NOT NULL,
                name        TEXT NOT NULL,
                transmitted INTEGER NOT NULL,
                link        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS files_inode_idx ON files(inode);

            CREATE TABLE IF NOT EXISTS buffers (
                buffer_id INTEGER PRIMARY KEY AUTOINCREMENT,
                url       TEXT NOT NULL,
                data      BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transmited (
                buffer_id INTEGER PRIMARY KEY
            );
            CREATE INDEX IF NOT EXISTS buffers_id_idx ON buffers(buffer_id);
            ",
        )
        .context("unable to initialize local cache schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Composite-key lookup on the saved-files index (§4.3, I3).
    pub fn is_present(&self, meta: &Metadata) -> Result<bool, Error> {
        let conn = self.conn.lock().unwrap();
        let key = meta.composite_key();
        let found: Option<i64> = conn
            .query_row(
                "SELECT file_id FROM files
                 WHERE name = ?1 AND type = ?2 AND uid = ?3 AND gid = ?4
                   AND ctime = ?5 AND mtime = ?6 AND mode = ?7 AND size = ?8 AND inode = ?9
                 LIMIT 1",
                params![
                    key.path,
                    key.file_type.as_str(),
                    key.uid,
                    key.gid,
                    key.ctime,
                    key.mtime,
                    key.mode,
                    key.size as i64,
                    key.inode as i64,
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert after a successful end-to-end transmission (§4.3).
    pub fn record_saved(&self, meta: &Metadata) -> Result<(), Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = current_time_secs();
        tx.execute(
            "INSERT INTO files
               (cache_time, type, inode, file_user, file_group, uid, gid,
                atime, ctime, mtime, mode, size, name, transmitted, link)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1, ?14)",
            params![
                now,
                meta.file_type.as_str(),
                meta.inode as i64,
                meta.owner,
                meta.group,
                meta.uid,
                meta.gid,
                meta.atime,
                meta.ctime,
                meta.mtime,
                meta.mode,
                meta.size as i64,
                meta.path,
                meta.link_target,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Append an unsent request to the buffer table (§4.4 failure path).
    pub fn buffer_unsent(&self, endpoint: &str, payload: &[u8]) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO buffers (url, data) VALUES (?1, ?2)",
            params![endpoint, payload],
        )?;
        Ok(())
    }

    pub fn has_unsent(&self) -> Result<bool, Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM buffers b
             WHERE NOT EXISTS (SELECT 1 FROM transmited t WHERE t.buffer_id = b.buffer_id)",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Re-POST every unsent row not yet in the transmitted set, then delete
    /// every row whose id made it into the transmitted set. Returns the
    /// number of rows successfully drained (§9, open question on the
    /// original's unused return value: this one is propagated).
    pub fn drain_unsent<F>(&self, mut post: F) -> Result<usize, Error>
    where
        F: FnMut(&str, &[u8]) -> Result<bool, Error>,
    {
        let rows: Vec<(i64, String, Vec<u8>)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT b.buffer_id, b.url, b.data FROM buffers b
                 WHERE NOT EXISTS (SELECT 1 FROM transmited t WHERE t.buffer_id = b.buffer_id)
                 ORDER BY b.buffer_id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut drained = 0;
        let mut drained_ids = Vec::new();
        for (buffer_id, url, data) in &rows {
            match post(url, data) {
                Ok(true) => {
                    let conn = self.conn.lock().unwrap();
                    conn.execute(
                        "INSERT OR IGNORE INTO transmited (buffer_id) VALUES (?1)",
                        params![buffer_id],
                    )?;
                    drained += 1;
                    drained_ids.push(*buffer_id);
                }
                Ok(false) => {
                    log::debug!("buffer {buffer_id} (url {url}) still not accepted by server");
                }
                Err(err) => {
                    log::warn!("error re-sending buffered request {buffer_id}: {err:#}");
                }
            }
        }

        if !drained_ids.is_empty() {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "DELETE FROM buffers WHERE buffer_id IN (
                    SELECT buffer_id FROM transmited
                 )",
                [],
            )?;
            conn.execute("DELETE FROM transmited", [])?;
        }

        Ok(drained)
    }
}

fn current_time_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_api_types::FileType;

    fn sample_metadata(path: &str) -> Metadata {
        Metadata {
            file_type: FileType::Regular,
            inode: 1,
            mode: 0o644,
            uid: 0,
            gid: 0,
            owner: "root".to_string(),
            group: "root".to_string(),
            atime: 1,
            ctime: 2,
            mtime: 3,
            size: 10,
            path: path.to_string(),
            link_target: String::new(),
            block_list: vec![],
            hostname: "host1".to_string(),
            data_already_sent: false,
        }
    }

    #[test]
    fn record_and_check_presence() {
        let cache = LocalCache::open(":memory:").unwrap();
        let meta = sample_metadata("/tmp/a");
        assert!(!cache.is_present(&meta).unwrap());
        cache.record_saved(&meta).unwrap();
        assert!(cache.is_present(&meta).unwrap());

        let mut changed = meta.clone();
        changed.mtime += 1;
        assert!(!cache.is_present(&changed).unwrap());
    }

    #[test]
    fn buffer_and_drain_unsent() {
        let cache = LocalCache::open(":memory:").unwrap();
        cache.buffer_unsent("/Meta.json", b"{}").unwrap();
        cache.buffer_unsent("/Data.json", b"{}").unwrap();
        assert!(cache.has_unsent().unwrap());

        let drained = cache.drain_unsent(|_url, _data| Ok(true)).unwrap();
        assert_eq!(drained, 2);
        assert!(!cache.has_unsent().unwrap());
    }

    #[test]
    fn drain_unsent_keeps_failed_rows_queued() {
        let cache = LocalCache::open(":memory:").unwrap();
        cache.buffer_unsent("/Meta.json", b"{}").unwrap();
        let drained = cache.drain_unsent(|_url, _data| Ok(false)).unwrap();
        assert_eq!(drained, 0);
        assert!(cache.has_unsent().unwrap());
    }
}
