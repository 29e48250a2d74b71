use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{Context, Error};
use cdp_api_types::{FileType, Metadata};
use regex::RegexSet;

/// Produces the metadata record of §3 for one filesystem entry (§4.2).
pub struct MetadataExtractor {
    hostname: String,
    exclude: CompiledExclusions,
}

/// An ordered list of pre-compiled exclusion regexes (§4.2 "Exclusion").
/// Patterns that fail to compile are dropped individually, with the
/// remainder still taking effect (§7 "Regex-compile failure").
struct CompiledExclusions {
    set: Option<RegexSet>,
}

impl CompiledExclusions {
    fn compile(patterns: &[String]) -> Self {
        let mut valid = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let case_insensitive = format!("(?i){pattern}");
            match regex::Regex::new(&case_insensitive) {
                Ok(_) => valid.push(case_insensitive),
                Err(err) => {
                    log::warn!("dropping invalid exclude pattern {pattern:?}: {err}");
                }
            }
        }
        let set = RegexSet::new(&valid).ok();
        Self { set }
    }

    fn matches(&self, path: &str) -> bool {
        match &self.set {
            Some(set) => set.is_match(path),
            None => false,
        }
    }
}

impl MetadataExtractor {
    pub fn new(hostname: String, exclude_patterns: &[String]) -> Self {
        Self {
            hostname,
            exclude: CompiledExclusions::compile(exclude_patterns),
        }
    }

    /// Returns `None` when `path` matches an exclusion pattern (silently
    /// skipped, per §4.2).
    pub fn extract(&self, path: &Path) -> Result<Option<Metadata>, Error> {
        let path_str = path
            .to_str()
            .with_context(|| format!("path {path:?} is not valid UTF-8"))?
            .to_string();

        if self.exclude.matches(&path_str) {
            log::debug!("excluding {path_str} (matched exclude pattern)");
            return Ok(None);
        }

        let fs_meta = std::fs::symlink_metadata(path)
            .with_context(|| format!("unable to stat {path_str}"))?;

        let file_type = classify(&fs_meta);
        let link_target = if file_type == FileType::Symlink {
            std::fs::read_link(path)
                .ok()
                .and_then(|p| p.to_str().map(|s| s.to_string()))
                .unwrap_or_default()
        } else {
            String::new()
        };

        let owner = user_name(fs_meta.uid()).unwrap_or_else(|| fs_meta.uid().to_string());
        let group = group_name(fs_meta.gid()).unwrap_or_else(|| fs_meta.gid().to_string());

        Ok(Some(Metadata {
            file_type,
            inode: fs_meta.ino(),
            mode: fs_meta.mode(),
            uid: fs_meta.uid(),
            gid: fs_meta.gid(),
            owner,
            group,
            atime: fs_meta.atime(),
            ctime: fs_meta.ctime(),
            mtime: fs_meta.mtime(),
            size: fs_meta.size(),
            path: path_str,
            link_target,
            block_list: Vec::new(),
            hostname: self.hostname.clone(),
            data_already_sent: false,
        }))
    }
}

fn classify(meta: &std::fs::Metadata) -> FileType {
    let file_type = meta.file_type();
    if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_file() {
        FileType::Regular
    } else {
        FileType::Other
    }
}

fn user_name(uid: u32) -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
}

fn group_name(gid: u32) -> Option<String> {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn extracts_regular_file_metadata() {
        let dir = std::env::temp_dir().join(format!("cdp-meta-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("a.txt");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(b"hello").unwrap();
        }

        let extractor = MetadataExtractor::new("host1".to_string(), &[]);
        let meta = extractor.extract(&path).unwrap().unwrap();
        assert_eq!(meta.file_type, FileType::Regular);
        assert_eq!(meta.size, 5);
        assert_eq!(meta.link_target, "");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn excludes_matching_path() {
        let dir = std::env::temp_dir().join(format!("cdp-meta-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("b.log");
        std::fs::File::create(&path).unwrap();

        let extractor =
            MetadataExtractor::new("host1".to_string(), &[r".*\.log$".to_string()]);
        let result = extractor.extract(&path).unwrap();
        assert!(result.is_none());

        std::fs::remove_dir_all(&dir).ok();
    }
}
