//! PowerShell command builders for the ssh transport.
//!
//! Everything is emitted as a single `-Command` payload; strings are single
//! quoted with embedded quotes doubled, file content travels base64.

use wmco_definitions::services::Service;

/// Maximum base64 characters sent per command when writing files
pub const UPLOAD_CHUNK: usize = 8000;

/// Single-quote a string for PowerShell
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Parent directory of a windows path
pub fn parent_dir(path: &str) -> Option<&str> {
    path.trim_end_matches('\\').rfind('\\').map(|i| &path[..i])
}

pub fn hostname() -> String {
    "[System.Net.Dns]::GetHostName()".to_string()
}

pub fn rename_computer(new_name: &str) -> String {
    format!(
        "Rename-Computer -NewName {} -Force -Restart",
        quote(new_name)
    )
}

pub fn ensure_dir(dir: &str) -> String {
    format!(
        "$null = New-Item -Force -ItemType Directory -Path {}",
        quote(dir)
    )
}

pub fn remove_path(path: &str) -> String {
    format!(
        "if (Test-Path {p}) {{ Remove-Item -Recurse -Force {p} }}",
        p = quote(path)
    )
}

/// Staging directory a [`swap_dir`] populates before going live
pub fn staging_dir(dst: &str) -> String {
    format!("{}.staging", dst.trim_end_matches('\\'))
}

/// Swap a fully-staged directory into place in one command.
///
/// The drop of the old tree and the rename of the staged one execute inside
/// a single remote invocation, so readers see the old set or the new set,
/// never a half-written one.
pub fn swap_dir(staging: &str, dst: &str) -> String {
    let target = dst.trim_end_matches('\\');
    format!(
        "if (Test-Path {t}) {{ Remove-Item -Recurse -Force {t} }}; Move-Item -Force {s} {t}",
        t = quote(target),
        s = quote(staging)
    )
}

/// Append one base64 chunk to the staging file next to `dst`
pub fn append_chunk(dst: &str, chunk: &str) -> String {
    format!(
        "Add-Content -Path {} -Value {}",
        quote(&staging_path(dst)),
        quote(chunk)
    )
}

/// Decode the staging file into place and drop it
pub fn commit_upload(dst: &str) -> String {
    let staging = staging_path(dst);
    format!(
        "[IO.File]::WriteAllBytes({dst}, [Convert]::FromBase64String(((Get-Content {st} -Raw) -replace '\\s',''))); Remove-Item -Force {st}",
        dst = quote(dst),
        st = quote(&staging)
    )
}

/// Drop any stale staging file before a fresh upload
pub fn clear_staging(dst: &str) -> String {
    remove_path(&staging_path(dst))
}

fn staging_path(dst: &str) -> String {
    format!("{}.b64", dst)
}

pub fn service_exists(name: &str) -> String {
    format!(
        "if (Get-Service -Name {} -ErrorAction SilentlyContinue) {{ 'true' }} else {{ 'false' }}",
        quote(name)
    )
}

pub fn create_service(svc: &Service, node_ip: &str, hostname: &str) -> String {
    let mut cmd = format!(
        "New-Service -Name {} -BinaryPathName {} -StartupType Automatic",
        quote(&svc.name),
        quote(&svc.command(node_ip, hostname))
    );
    if !svc.dependencies.is_empty() {
        let deps: Vec<String> = svc.dependencies.iter().map(|d| quote(d)).collect();
        cmd.push_str(&format!(" -DependsOn @({})", deps.join(",")));
    }
    cmd
}

/// Declare the failure recovery policy via the service controller
pub fn set_recovery(svc: &Service) -> Option<String> {
    if svc.recovery_actions.is_empty() {
        return None;
    }
    let actions: Vec<String> = svc
        .recovery_actions
        .iter()
        .map(|delay| format!("restart/{}", delay * 1000))
        .collect();
    Some(format!(
        "sc.exe failure {} reset= {} actions= {}",
        quote(&svc.name),
        svc.recovery_reset_seconds,
        actions.join("/")
    ))
}

/// Declare environment variables on the service's registry key
pub fn set_service_env(svc: &Service) -> Option<String> {
    if svc.env.is_empty() {
        return None;
    }
    let pairs: Vec<String> = svc
        .env
        .iter()
        .map(|(k, v)| quote(&format!("{}={}", k, v)))
        .collect();
    Some(format!(
        "Set-ItemProperty -Path {} -Name Environment -Type MultiString -Value @({})",
        quote(&format!(
            "HKLM:\\SYSTEM\\CurrentControlSet\\Services\\{}",
            svc.name
        )),
        pairs.join(",")
    ))
}

/// Record who manages the service; shows up in service manager tooling
pub fn set_service_description(name: &str) -> String {
    format!(
        "sc.exe description {} {}",
        quote(name),
        quote("OpenShift managed Windows worker service")
    )
}

/// Allow the exporter port through the host firewall
pub fn allow_inbound_port(rule: &str, port: i32) -> String {
    format!(
        "if (-not (Get-NetFirewallRule -Name {r} -ErrorAction SilentlyContinue)) {{ \
         New-NetFirewallRule -Name {r} -DisplayName {r} -Direction Inbound -Action Allow \
         -Protocol TCP -LocalPort {p} -EdgeTraversalPolicy Allow }}",
        r = quote(rule),
        p = port
    )
}

pub fn remove_firewall_rule(rule: &str) -> String {
    format!(
        "Remove-NetFirewallRule -Name {} -ErrorAction SilentlyContinue",
        quote(rule)
    )
}

pub fn start_service(name: &str) -> String {
    format!("Start-Service -Name {}", quote(name))
}

pub fn stop_service(name: &str) -> String {
    format!("Stop-Service -Name {} -Force", quote(name))
}

pub fn delete_service(name: &str) -> String {
    format!("sc.exe delete {}", quote(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wmco_definitions::services::Service;

    #[test]
    fn quoting_doubles_single_quotes() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), "'it''s'");
    }

    #[test]
    fn parent_dirs() {
        assert_eq!(parent_dir("C:\\k\\kubelet.conf"), Some("C:\\k"));
        assert_eq!(parent_dir("C:\\k\\tls\\"), Some("C:\\k"));
        assert_eq!(parent_dir("kubelet.conf"), None);
    }

    #[test]
    fn service_creation_includes_dependencies() {
        let svc = Service {
            name: "kubelet".into(),
            binary_path: "C:\\k\\bin\\kubelet.exe".into(),
            args: vec!["--node-ip".into(), "{{NODE_IP}}".into()],
            dependencies: vec!["containerd".into()],
            recovery_actions: vec![5, 10],
            recovery_reset_seconds: 600,
            ..Default::default()
        };
        let cmd = create_service(&svc, "10.0.0.5", "winhost-5");
        assert!(cmd.contains("-Name 'kubelet'"));
        assert!(cmd.contains("--node-ip 10.0.0.5"));
        assert!(cmd.contains("-DependsOn @('containerd')"));

        let rec = set_recovery(&svc).unwrap();
        assert!(rec.contains("actions= restart/5000/restart/10000"));
        assert!(rec.contains("reset= 600"));
    }

    #[test]
    fn recovery_absent_without_actions() {
        let svc = Service::default();
        assert!(set_recovery(&svc).is_none());
        assert!(set_service_env(&svc).is_none());
    }

    #[test]
    fn directory_swap_is_one_command() {
        let staging = staging_dir("C:\\k\\containerd\\registries\\");
        assert_eq!(staging, "C:\\k\\containerd\\registries.staging");
        let cmd = swap_dir(&staging, "C:\\k\\containerd\\registries\\");
        assert!(cmd.contains("Move-Item -Force 'C:\\k\\containerd\\registries.staging'"));
        assert!(cmd.contains("Remove-Item -Recurse -Force 'C:\\k\\containerd\\registries'"));
        // drop-and-rename travel together; no uploads can interleave
        assert!(cmd.contains("}; Move-Item"));
    }

    #[test]
    fn firewall_rule_is_guarded() {
        let cmd = allow_inbound_port("windows-exporter", 9182);
        assert!(cmd.contains("Get-NetFirewallRule"));
        assert!(cmd.contains("-LocalPort 9182"));
        // running twice must not try to create the rule twice
        assert!(cmd.starts_with("if (-not"));
    }
}
