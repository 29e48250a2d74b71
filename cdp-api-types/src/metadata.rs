use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use crate::block::BlockHash;

/// The kind of filesystem entry a metadata record describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Regular => "regular",
            FileType::Directory => "directory",
            FileType::Symlink => "symlink",
            FileType::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "regular" => FileType::Regular,
            "directory" => FileType::Directory,
            "symlink" => FileType::Symlink,
            "other" => FileType::Other,
            other => bail!("unknown file type {other:?}"),
        })
    }
}

/// One save's description of one filesystem entry (§3 "File metadata record").
///
/// Append-only: a new `Metadata` is produced every save; old versions are
/// never mutated once a `Metadata` has been written to the server's
/// per-host log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metadata {
    pub file_type: FileType,
    pub inode: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub owner: String,
    pub group: String,
    pub atime: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub size: u64,
    pub path: String,
    pub link_target: String,
    pub block_list: Vec<BlockHash>,
    pub hostname: String,
    pub data_already_sent: bool,
}

impl Metadata {
    /// The composite key used by the local cache's saved-files index (§3,
    /// invariant I3): `(path, type, uid, gid, ctime, mtime, mode, size, inode)`.
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey {
            path: self.path.clone(),
            file_type: self.file_type,
            uid: self.uid,
            gid: self.gid,
            ctime: self.ctime,
            mtime: self.mtime,
            mode: self.mode,
            size: self.size,
            inode: self.inode,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CompositeKey {
    pub path: String,
    pub file_type: FileType,
    pub uid: u32,
    pub gid: u32,
    pub ctime: i64,
    pub mtime: i64,
    pub mode: u32,
    pub size: u64,
    pub inode: u64,
}

/// The `Meta.json` wire shape (§6.1): `{msg_id, filetype, mode, atime, ctime,
/// mtime, fsize, inode, owner, group, uid, gid, name, link, hostname,
/// data_sent, hash_list}`.
#[derive(Serialize, Deserialize)]
pub struct WireMetadata {
    pub msg_id: u32,
    pub filetype: String,
    pub mode: u32,
    pub atime: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub fsize: u64,
    pub inode: u64,
    pub owner: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub link: String,
    pub hostname: String,
    pub data_sent: bool,
    pub hash_list: Vec<String>,
}

impl WireMetadata {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            msg_id: 1,
            filetype: meta.file_type.as_str().to_string(),
            mode: meta.mode,
            atime: meta.atime,
            ctime: meta.ctime,
            mtime: meta.mtime,
            fsize: meta.size,
            inode: meta.inode,
            owner: meta.owner.clone(),
            group: meta.group.clone(),
            uid: meta.uid,
            gid: meta.gid,
            name: meta.path.clone(),
            link: meta.link_target.clone(),
            hostname: meta.hostname.clone(),
            data_sent: meta.data_already_sent,
            hash_list: meta.block_list.iter().map(|h| h.to_base64()).collect(),
        }
    }

    pub fn into_metadata(self) -> Result<Metadata, Error> {
        let mut block_list = Vec::with_capacity(self.hash_list.len());
        for h in &self.hash_list {
            block_list.push(BlockHash::from_base64(h)?);
        }
        Ok(Metadata {
            file_type: FileType::from_str(&self.filetype)?,
            inode: self.inode,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            owner: self.owner,
            group: self.group,
            atime: self.atime,
            ctime: self.ctime,
            mtime: self.mtime,
            size: self.fsize,
            path: self.name,
            link_target: self.link,
            block_list,
            hostname: self.hostname,
            data_already_sent: self.data_sent,
        })
    }

    /// Render one line of the per-host metadata log (§6.2).
    pub fn to_log_line(&self) -> String {
        let hashes: Vec<String> = self
            .hash_list
            .iter()
            .map(|h| format!("\"{h}\""))
            .collect();
        let mut line = format!(
            "{}, {}, {}, {}, {}, {}, {}, \"{}\", \"{}\", {}, {}, \"{}\", \"{}\"",
            self.filetype,
            self.inode,
            self.mode,
            self.atime,
            self.ctime,
            self.mtime,
            self.fsize,
            self.owner,
            self.group,
            self.uid,
            self.gid,
            self.name,
            self.link,
        );
        for h in hashes {
            line.push_str(", ");
            line.push_str(&h);
        }
        line
    }

    /// Parse one line previously produced by [`Self::to_log_line`].
    pub fn from_log_line(line: &str) -> Result<Self, Error> {
        let fields = split_log_line(line)?;
        if fields.len() < 12 {
            bail!("metadata log line has too few fields ({})", fields.len());
        }
        let unquote = |s: &str| s.trim_matches('"').to_string();
        Ok(Self {
            msg_id: 1,
            filetype: fields[0].trim().to_string(),
            inode: fields[1].trim().parse()?,
            mode: fields[2].trim().parse()?,
            atime: fields[3].trim().parse()?,
            ctime: fields[4].trim().parse()?,
            mtime: fields[5].trim().parse()?,
            fsize: fields[6].trim().parse()?,
            owner: unquote(fields[7].trim()),
            group: unquote(fields[8].trim()),
            uid: fields[9].trim().parse()?,
            gid: fields[10].trim().parse()?,
            name: unquote(fields[11].trim()),
            link: fields.get(12).map(|s| unquote(s.trim())).unwrap_or_default(),
            hostname: String::new(),
            data_sent: true,
            hash_list: fields
                .get(13..)
                .map(|rest| rest.iter().map(|s| unquote(s.trim())).collect())
                .unwrap_or_default(),
        })
    }
}

/// Split a metadata log line on top-level commas, respecting double quotes
/// so that paths containing commas are not mis-split.
fn split_log_line(line: &str) -> Result<Vec<String>, Error> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in line.trim_end_matches('\n').chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    fields.push(current);
    Ok(fields)
}
