//! Parsing of the producer command's output.
//!
//! The command prints one absolute path per line naming the files to
//! retrieve. Blank lines are ignored; anything that is not an absolute path is
//! rejected individually and never fails the whole manifest.

/// A line of output that was not an absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLine {
    /// 1-based line number in the captured output.
    pub line_no: usize,
    pub content: String,
}

/// Paths collected from captured output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub paths: Vec<String>,
    pub rejected: Vec<RejectedLine>,
}

impl Manifest {
    /// Collect paths from raw stdout bytes (lossy UTF-8).
    pub fn from_output(output: &[u8]) -> Self {
        Self::parse(&String::from_utf8_lossy(output))
    }

    pub fn parse(output: &str) -> Self {
        let mut manifest = Self::default();

        for (idx, raw) in output.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if line.starts_with('/') {
                manifest.paths.push(line.to_string());
            } else {
                manifest.rejected.push(RejectedLine {
                    line_no: idx + 1,
                    content: line.to_string(),
                });
            }
        }

        manifest
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_absolute_paths_and_skips_the_rest() {
        let manifest = Manifest::parse("\n/tmp/a\n   \n/tmp/b\nrelative\n");

        assert_eq!(manifest.paths, vec!["/tmp/a", "/tmp/b"]);
        assert_eq!(
            manifest.rejected,
            vec![RejectedLine {
                line_no: 5,
                content: "relative".to_string()
            }]
        );
    }

    #[test]
    fn empty_output_is_an_empty_manifest() {
        let manifest = Manifest::from_output(b"");
        assert!(manifest.is_empty());
        assert!(manifest.rejected.is_empty());
    }

    #[test]
    fn tolerates_crlf_line_endings() {
        let manifest = Manifest::from_output(b"/var/dump.sql\r\n/var/wal.tar\r\n");
        assert_eq!(manifest.paths, vec!["/var/dump.sql", "/var/wal.tar"]);
    }
}
