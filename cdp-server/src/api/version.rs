use cdp_api_types::{LibraryVersion, VersionInfo};
use cdp_buildcfg::{CDP_PKG_RELEASE, CDP_PKG_VERSION};

/// Build the `/Version.json` response body (§6.1, §6.5).
pub fn version_info() -> VersionInfo {
    VersionInfo {
        name: "cdp-server".to_string(),
        date: "unknown".to_string(),
        version: CDP_PKG_VERSION.to_string(),
        revision: CDP_PKG_RELEASE.to_string(),
        licence: "AGPL-3".to_string(),
        authors: vec!["CDP Backup Contributors".to_string()],
        librairies: vec![
            LibraryVersion {
                lib: "hyper".to_string(),
                version: "0.14".to_string(),
            },
            LibraryVersion {
                lib: "openssl".to_string(),
                version: "0.10".to_string(),
            },
        ],
    }
}
