use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;

use crate::{
    constants::{MACHINE_API_NAMESPACE, USERDATA_SECRET},
    platform::Platform,
};

/// Key within the user-data secret the machine facility reads
const USERDATA_KEY: &str = "userData";

/// Generate the cloud user-data payload for newly provisioned hosts.
///
/// The payload installs the operator's public key into the administrators'
/// authorized keys file so the configure pipeline can authenticate. Platforms
/// that hand out multiple NICs additionally persist the primary address for
/// the bootstrap step to pick up.
pub fn generate(platform: &Platform, authorized_key: &str) -> String {
    let mut script = String::from("<powershell>\n");
    script.push_str(
        "$authorizedKeyFilePath = \"$env:ProgramData\\ssh\\administrators_authorized_keys\"\n",
    );
    script.push_str("New-Item -Force $authorizedKeyFilePath\n");
    script.push_str(&format!(
        "echo \"{}\" | Out-File $authorizedKeyFilePath -Encoding ascii\n",
        authorized_key.trim_end()
    ));
    script.push_str("icacls $authorizedKeyFilePath /inheritance:r\n");
    script.push_str("icacls $authorizedKeyFilePath /grant SYSTEM:`(F`)\n");
    script.push_str("icacls $authorizedKeyFilePath /grant BUILTIN\\Administrators:`(F`)\n");
    script.push_str("Set-Service -Name sshd -StartupType 'Automatic'\n");
    script.push_str("Start-Service sshd\n");
    if platform.needs_node_ip() {
        script.push_str(
            "(Get-NetIPAddress -AddressFamily IPv4 -InterfaceAlias 'Ethernet*').IPAddress \
             | Select-Object -First 1 | Out-File C:\\k\\node-ip.txt -Encoding ascii\n",
        );
    }
    script.push_str("</powershell>\n<persist>true</persist>");
    script
}

/// The user-data secret as it must exist in the machine-api namespace.
pub fn secret(platform: &Platform, authorized_key: &str) -> Secret {
    let mut s = Secret::default();
    s.metadata.name = Some(USERDATA_SECRET.to_string());
    s.metadata.namespace = Some(MACHINE_API_NAMESPACE.to_string());
    let mut data = BTreeMap::new();
    data.insert(
        USERDATA_KEY.to_string(),
        ByteString(generate(platform, authorized_key).into_bytes()),
    );
    s.data = Some(data);
    s
}

/// Compare an on-cluster secret against the expected payload.
pub fn matches(existing: &Secret, platform: &Platform, authorized_key: &str) -> bool {
    let expected = generate(platform, authorized_key).into_bytes();
    existing
        .data
        .as_ref()
        .and_then(|d| d.get(USERDATA_KEY))
        .map(|b| b.0 == expected)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::{generate, matches, secret};
    use crate::platform::Platform;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFakeFakeFakeFake operator";

    #[test]
    fn payload_embeds_key() {
        let data = generate(&Platform::Aws, KEY);
        assert!(data.contains(KEY));
        assert!(data.starts_with("<powershell>"));
        assert!(data.ends_with("<persist>true</persist>"));
    }

    #[test]
    fn node_ip_capture_is_platform_dependent() {
        assert!(!generate(&Platform::Aws, KEY).contains("node-ip.txt"));
        assert!(generate(&Platform::VSphere, KEY).contains("node-ip.txt"));
    }

    #[test]
    fn secret_matches_its_own_generation() {
        let s = secret(&Platform::Aws, KEY);
        assert_eq!(s.metadata.name.as_deref(), Some("windows-user-data"));
        assert!(matches(&s, &Platform::Aws, KEY));
        assert!(!matches(&s, &Platform::Aws, "ssh-rsa other"));
        assert!(!matches(&s, &Platform::VSphere, KEY));
    }
}
