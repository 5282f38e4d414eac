/// Administrative verbs that require privilege elevation when they lead a
/// command: package managers, service control, user/group management and
/// firewall tooling.
const ADMIN_VERBS: [&str; 22] = [
    "apt",
    "apt-get",
    "dpkg",
    "yum",
    "dnf",
    "pacman",
    "zypper",
    "snap",
    "systemctl",
    "service",
    "useradd",
    "userdel",
    "usermod",
    "groupadd",
    "groupdel",
    "adduser",
    "deluser",
    "ufw",
    "iptables",
    "ip6tables",
    "nft",
    "firewall-cmd",
];

/// Filesystem prefixes only root may touch.
const PROTECTED_PREFIXES: [&str; 5] = [
    "/etc/",
    "/var/log/",
    "/root/",
    "/boot/",
    "/usr/lib/systemd/",
];

pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

/// Whether a command needs privilege elevation: it either starts with a
/// known administrative verb or targets a protected filesystem prefix.
/// Classification only; the command itself is never rewritten.
pub fn needs_elevation(command: &str) -> bool {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return false;
    }
    if let Some(verb) = trimmed.split_whitespace().next() {
        let verb = verb.rsplit('/').next().unwrap_or(verb);
        if ADMIN_VERBS.contains(&verb) {
            return true;
        }
    }
    trimmed
        .split_whitespace()
        .any(|token| PROTECTED_PREFIXES.iter().any(|prefix| token.starts_with(prefix)))
}

/// Wrap an elevation-needing command with a non-interactive sudo prefix,
/// leaving its semantics intact. Commands that need no elevation pass
/// through unchanged.
pub fn elevate(command: &str) -> String {
    if needs_elevation(command) {
        format!("sudo -n bash -c {}", shell_quote(command))
    } else {
        command.to_string()
    }
}
