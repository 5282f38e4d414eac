use anyhow::{anyhow, bail, Context, Result};
use rand::RngCore;
use std::path::Path;

use crate::model::{PortMapping, Server, VolumeMapping};

use super::transport::{shell_quote, CommandResult, CommandTransport};

pub(crate) fn random_hex(bytes: usize) -> String {
    let mut raw = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut raw);
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

/// Run a command and treat a non-zero exit as a hard failure. The pipeline
/// stages use this wherever a partial remote effect would be unsafe.
pub fn exec_checked(
    transport: &dyn CommandTransport,
    server: &Server,
    command: &str,
) -> Result<CommandResult> {
    let result = transport.exec(server, command)?;
    if !result.success() {
        bail!(
            "command failed ({}): {command}: {}",
            result.exit_code,
            result.stderr.trim()
        );
    }
    Ok(result)
}

/// Resolve a declared volume to an absolute path on the given host. Bind
/// mounts pass through unchanged; named volumes are resolved by asking the
/// volume driver for its mountpoint, falling back to the default Docker
/// volume root when inspection fails.
pub fn resolve_volume_path(
    transport: &dyn CommandTransport,
    server: &Server,
    volume: &VolumeMapping,
    volume_root: &Path,
) -> Result<String> {
    if volume.is_bind_mount() {
        return Ok(volume.host.clone());
    }
    let inspect = transport.exec(
        server,
        &format!(
            "docker volume inspect -f '{{{{ .Mountpoint }}}}' {}",
            shell_quote(&volume.host)
        ),
    )?;
    let mountpoint = inspect.stdout.trim();
    if inspect.success() && !mountpoint.is_empty() {
        return Ok(mountpoint.to_string());
    }
    Ok(volume_root
        .join(&volume.host)
        .join("_data")
        .to_string_lossy()
        .into_owned())
}

/// Fail unless the path exists on the remote host.
pub fn verify_remote_path(
    transport: &dyn CommandTransport,
    server: &Server,
    path: &str,
) -> Result<()> {
    let result = transport.exec(server, &format!("test -e {}", shell_quote(path)))?;
    if !result.success() {
        return Err(anyhow!("volume path {path} does not exist on {}", server.host));
    }
    Ok(())
}

/// Size of a remote file in bytes.
pub fn remote_file_size(
    transport: &dyn CommandTransport,
    server: &Server,
    path: &str,
) -> Result<u64> {
    let result = exec_checked(
        transport,
        server,
        &format!("stat -c %s {}", shell_quote(path)),
    )?;
    result
        .stdout
        .trim()
        .parse::<u64>()
        .with_context(|| format!("unexpected stat output for {path}: {}", result.stdout.trim()))
}

fn sanitize_name(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "deployment".to_string()
    } else {
        cleaned
    }
}

/// Mint a fresh volume name for a migrated deployment. The source volume's
/// identity is never reused so source and target can coexist.
pub fn mint_volume_name(new_container_name: &str, index: usize) -> String {
    format!(
        "{}_vol{index}_{}",
        sanitize_name(new_container_name),
        random_hex(4)
    )
}

/// Merged configuration for `docker create` on the migration target.
pub struct CreateSpec<'a> {
    pub container_name: &'a str,
    pub image: &'a str,
    pub ports: &'a [PortMapping],
    pub env: &'a [String],
    pub volumes: &'a [VolumeMapping],
    pub restart_policy: Option<&'a str>,
    pub network_mode: Option<&'a str>,
    pub extra_args: &'a [String],
    pub command: Option<&'a str>,
}

/// Build the `docker create` command line. `create`, not `run`: the
/// container must exist on the target without starting until the caller
/// decides to.
pub fn build_create_command(spec: &CreateSpec<'_>) -> String {
    let mut parts: Vec<String> = vec![
        "docker create".to_string(),
        format!("--name {}", shell_quote(spec.container_name)),
    ];
    for port in spec.ports {
        parts.push(format!("-p {}:{}", port.host_port, port.container_port));
    }
    for entry in spec.env {
        parts.push(format!("-e {}", shell_quote(entry)));
    }
    for volume in spec.volumes {
        parts.push(format!(
            "-v {}",
            shell_quote(&format!("{}:{}", volume.host, volume.container))
        ));
    }
    if let Some(policy) = spec.restart_policy.map(str::trim).filter(|v| !v.is_empty()) {
        parts.push(format!("--restart {}", shell_quote(policy)));
    }
    if let Some(network) = spec.network_mode.map(str::trim).filter(|v| !v.is_empty()) {
        parts.push(format!("--network {}", shell_quote(network)));
    }
    for arg in spec.extra_args {
        let arg = arg.trim();
        if !arg.is_empty() {
            parts.push(arg.to_string());
        }
    }
    parts.push(shell_quote(spec.image));
    if let Some(command) = spec.command.map(str::trim).filter(|v| !v.is_empty()) {
        parts.push(command.to_string());
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_server, ScriptedTransport};

    #[test]
    fn bind_mounts_resolve_to_themselves() -> Result<()> {
        let transport = ScriptedTransport::new();
        let server = test_server("src");
        let volume = VolumeMapping {
            host: "/data".to_string(),
            container: "/app/data".to_string(),
        };
        let path = resolve_volume_path(
            &transport,
            &server,
            &volume,
            Path::new("/var/lib/docker/volumes"),
        )?;
        assert_eq!(path, "/data");
        assert!(transport.commands().is_empty(), "no remote call for binds");
        Ok(())
    }

    #[test]
    fn named_volumes_use_driver_mountpoint() -> Result<()> {
        let transport = ScriptedTransport::new();
        transport.respond_with("docker volume inspect", 0, "/mnt/fast/app_data\n", "");
        let server = test_server("src");
        let volume = VolumeMapping {
            host: "app_data".to_string(),
            container: "/app/data".to_string(),
        };
        let path = resolve_volume_path(
            &transport,
            &server,
            &volume,
            Path::new("/var/lib/docker/volumes"),
        )?;
        assert_eq!(path, "/mnt/fast/app_data");
        Ok(())
    }

    #[test]
    fn named_volume_inspection_failure_falls_back_to_default_root() -> Result<()> {
        let transport = ScriptedTransport::new();
        transport.respond_with("docker volume inspect", 1, "", "no such volume");
        let server = test_server("src");
        let volume = VolumeMapping {
            host: "app_data".to_string(),
            container: "/app/data".to_string(),
        };
        let path = resolve_volume_path(
            &transport,
            &server,
            &volume,
            Path::new("/var/lib/docker/volumes"),
        )?;
        assert_eq!(path, "/var/lib/docker/volumes/app_data/_data");
        Ok(())
    }

    #[test]
    fn minted_volume_names_are_unique_and_sanitized() {
        let a = mint_volume_name("my app!", 0);
        let b = mint_volume_name("my app!", 0);
        assert!(a.starts_with("my_app__vol0_"));
        assert_ne!(a, b);
    }

    #[test]
    fn create_command_merges_full_configuration() {
        let ports = [PortMapping {
            host_port: 8080,
            container_port: 80,
        }];
        let env = ["RUST_LOG=info".to_string()];
        let volumes = [VolumeMapping {
            host: "web_vol0_ab12".to_string(),
            container: "/srv".to_string(),
        }];
        let extra = ["--label app=web".to_string()];
        let spec = CreateSpec {
            container_name: "web-2",
            image: "nginx:1.27",
            ports: &ports,
            env: &env,
            volumes: &volumes,
            restart_policy: Some("unless-stopped"),
            network_mode: Some("bridge"),
            extra_args: &extra,
            command: Some("nginx -g 'daemon off;'"),
        };
        let command = build_create_command(&spec);
        assert_eq!(
            command,
            "docker create --name 'web-2' -p 8080:80 -e 'RUST_LOG=info' \
             -v 'web_vol0_ab12:/srv' --restart 'unless-stopped' --network 'bridge' \
             --label app=web 'nginx:1.27' nginx -g 'daemon off;'"
        );
    }

    #[test]
    fn create_command_skips_empty_options() {
        let spec = CreateSpec {
            container_name: "app",
            image: "app:latest",
            ports: &[],
            env: &[],
            volumes: &[],
            restart_policy: None,
            network_mode: Some("  "),
            extra_args: &[],
            command: None,
        };
        assert_eq!(
            build_create_command(&spec),
            "docker create --name 'app' 'app:latest'"
        );
    }

    #[test]
    fn exec_checked_surfaces_exit_code_and_stderr() {
        let transport = ScriptedTransport::new();
        transport.respond_with("docker pull", 125, "", "manifest unknown");
        let server = test_server("tgt");
        let err = exec_checked(&transport, &server, "docker pull 'missing:tag'").unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("125"));
        assert!(message.contains("manifest unknown"));
    }
}
