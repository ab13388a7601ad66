//! Host distribution probe. The engine and the netplan backend gate
//! Debian-12-specific behavior on this.
use std::{fs, path::Path};

/// Parsed subset of `/etc/os-release`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    /// `ID` field, e.g. `debian`
    pub id: String,
    /// `VERSION_ID` field, e.g. `12`
    pub version_id: String,
}

impl OsRelease {
    /// Read and parse an os-release file; missing file yields the default
    pub fn load(path: impl AsRef<Path>) -> OsRelease {
        fs::read_to_string(path)
            .map(|s| Self::parse(&s))
            .unwrap_or_default()
    }

    /// Parse os-release content
    pub fn parse(content: &str) -> OsRelease {
        let mut out = OsRelease::default();
        for line in content.lines() {
            let Some((key, val)) = line.split_once('=') else {
                continue;
            };
            let val = val.trim().trim_matches('"');
            match key.trim() {
                "ID" => out.id = val.to_owned(),
                "VERSION_ID" => out.version_id = val.to_owned(),
                _ => {}
            }
        }
        out
    }

    /// Debian 12 ships a default netplan file the agent must not orphan
    pub fn is_debian12(&self) -> bool {
        self.id == "debian" && self.version_id == "12"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_fields() {
        let os = OsRelease::parse("PRETTY_NAME=\"Debian GNU/Linux 12\"\nID=debian\nVERSION_ID=\"12\"\n");
        assert_eq!(os.id, "debian");
        assert_eq!(os.version_id, "12");
        assert!(os.is_debian12());
    }

    #[test]
    fn other_distro_is_not_debian12() {
        let os = OsRelease::parse("ID=ubuntu\nVERSION_ID=\"22.04\"\n");
        assert!(!os.is_debian12());
        assert!(!OsRelease::default().is_debian12());
    }
}
