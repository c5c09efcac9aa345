use regex::Regex;
use std::sync::LazyLock;

use crate::virtualbox::errors::Result;

/// `Name:            vboxnet0` as printed by `list hostonlyifs` and `list dhcpservers`.
pub static RE_COLON_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.+):\s+(.*)").expect("valid regex"));

/// `cpus=1` from `showvminfo --machinereadable`.
pub static RE_EQUAL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.+)=(.*)").expect("valid regex"));

/// `"SATA-1-0"="/path/to/disk.vmdk"` from `showvminfo --machinereadable`.
pub static RE_EQUAL_QUOTE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(.+)"="(.*)""#).expect("valid regex"));

pub static RE_MACHINE_NOT_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Could not find a registered machine named '(.+)'").expect("valid regex")
});

/// Walk `output` line by line and hand every `(key, value)` captured by `re` to
/// `visit`. Lines the template does not match are skipped. The first error
/// returned by `visit` stops the walk.
pub fn parse_key_values<F>(output: &str, re: &Regex, mut visit: F) -> Result<()>
where
    F: FnMut(&str, &str) -> Result<()>,
{
    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        let Some(caps) = re.captures(line) else {
            continue;
        };

        let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let value = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        visit(key, value)?;
    }

    Ok(())
}

pub fn is_machine_not_found(stderr: &str) -> bool {
    RE_MACHINE_NOT_FOUND.is_match(stderr)
}
