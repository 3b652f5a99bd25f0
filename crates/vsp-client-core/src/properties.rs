use std::cmp::Ordering;

/// Snapshot of one installed extension instance as reported by the system.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtensionProperties {
    pub identifier: String,
    pub bundle_version: String,
    pub short_version: String,
    pub enabled: bool,
    pub awaiting_user_approval: bool,
    pub uninstalling: bool,
}

impl ExtensionProperties {
    /// An enabled installation of `identifier` at `bundle_version`.
    pub fn enabled(identifier: impl Into<String>, bundle_version: impl Into<String>) -> Self {
        let bundle_version = bundle_version.into();
        Self {
            identifier: identifier.into(),
            short_version: bundle_version.clone(),
            bundle_version,
            enabled: true,
            awaiting_user_approval: false,
            uninstalling: false,
        }
    }
}

/// Compare dotted version strings numerically, component by component.
/// Missing components count as zero; non-numeric components as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.').map(version_component);
    let mut right = b.split('.').map(version_component);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => match l.unwrap_or(0).cmp(&r.unwrap_or(0)) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

fn version_component(part: &str) -> u64 {
    let part = part.trim();
    let digits = part
        .find(|c: char| !c.is_ascii_digit())
        .map_or(part, |end| &part[..end]);
    digits.parse().unwrap_or(0)
}

/// Pick the enabled installation with the highest bundle version.
pub fn select_installed(properties: &[ExtensionProperties]) -> Option<&ExtensionProperties> {
    properties
        .iter()
        .filter(|props| props.enabled)
        .max_by(|a, b| compare_versions(&a.bundle_version, &b.bundle_version))
}
