//! Masking of volatile values in failure reasons.

use regex::Regex;

use super::MiningError;

/// Pattern and mask name, applied in order. Earlier rules win where
/// matches overlap.
const RULES: &[(&str, &str)] = &[
    (r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{6}[+-]\d{4}", "TIMESTAMP"),
    (r"smithi\d+", "SMITHI*"),
    (r"mon\.[A-Za-z0-9]+", "MON*"),
    (r"osd\.[A-Za-z0-9]+", "OSD*"),
    (r"\d{1,} OSD\(s\)", "OSD_COUNT"),
    (r"\d{1,} (pg|PG)", "PG_COUNT"),
    (r"\d+/\d+ mon", "MON_COUNT"),
    (r"pid=(\d+)", "PID_NUMBER"),
    (r"tries \(\d+\)", "RETRY_COUNT"),
    (r"--fsid \S+", "CLUSTER_FSID"),
    (r"\d+ sec*|\d+s", "SECONDS_COUNT"),
    (r"process (\d+)", "PROCESS_COUNT"),
    (r"\d+.*filesystem", "FILESYSTEM_COUNT"),
    (r"ceph:\w+", "CEPH_IMAGE_REFERENCE"),
    (r"CEPH_REF=\w+", "CEPH_REFERENCE"),
    (r"audit\(\S+\)", "AUDIT_REFERENCE"),
    (r"centos.*(\d).*stream", "CENTOS_STREAM_VERSION"),
    (r"ubuntu.(\d+).(\d+)", "UBUNTU_VERSION"),
    (r"(\d+).(\d+).(\d+)-(\d+).(\S+)", "CEPH_VERSION"),
    (r"\d{1,} host \(\d{1,} osds\)", "OSD_HOST_DOWN_COUNT"),
    (r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d{1,}/\d{1,}", "CLUSTER_ADDRESS"),
];

/// Replaces timestamps, hosts, daemon ids, counts and versions with
/// `<NAME>` placeholders so that reasons differing only in those values
/// land in the same template.
pub struct Masker {
    rules: Vec<(Regex, String)>,
}

impl Masker {
    pub fn new() -> Result<Self, MiningError> {
        let rules = RULES
            .iter()
            .map(|&(pattern, name)| {
                Regex::new(pattern)
                    .map(|re| (re, format!("<{name}>")))
                    .map_err(|source| MiningError::Pattern { pattern, source })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { rules })
    }

    pub fn mask(&self, reason: &str) -> String {
        let mut masked = reason.trim().to_string();
        for (re, mask) in &self.rules {
            if re.is_match(&masked) {
                masked = re.replace_all(&masked, regex::NoExpand(mask)).into_owned();
            }
        }
        masked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masker() -> Masker {
        Masker::new().unwrap()
    }

    #[test]
    fn test_hosts_and_daemons_are_masked() {
        assert_eq!(
            masker().mask("Command failed on smithi042 with status 1: osd.3 is down"),
            "Command failed on <SMITHI*> with status 1: <OSD*> is down"
        );
        assert_eq!(masker().mask("mon.a has slow ops"), "<MON*> has slow ops");
    }

    #[test]
    fn test_timestamps_and_counts_are_masked() {
        assert_eq!(
            masker().mask("2024-05-01T10:00:00.123456+0000 cluster [WRN] 3 OSD(s) down"),
            "<TIMESTAMP> cluster [WRN] <OSD_COUNT> down"
        );
        assert_eq!(
            masker().mask("reached maximum tries (50) after waiting for 300s"),
            "reached maximum <RETRY_COUNT> after waiting for <SECONDS_COUNT>"
        );
        assert_eq!(masker().mask("hit max job timeout pid=12345"), "hit max job timeout <PID_NUMBER>");
    }

    #[test]
    fn test_versions_and_addresses_are_masked() {
        assert_eq!(
            masker().mask("package 19.0.0-1234.gabcdef missing"),
            "package <CEPH_VERSION> missing"
        );
        assert_eq!(masker().mask("ubuntu 22.04 repo down"), "<UBUNTU_VERSION> repo down");
        assert_eq!(
            masker().mask("cannot reach 172.21.15.42:6789/0 now"),
            "cannot reach <CLUSTER_ADDRESS> now"
        );
        assert_eq!(masker().mask("pull ceph:v18 failed"), "pull <CEPH_IMAGE_REFERENCE> failed");
    }

    #[test]
    fn test_plain_text_is_untouched() {
        assert_eq!(masker().mask("  saw valgrind issues  "), "saw valgrind issues");
    }
}
