use base64::prelude::*;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::params::{BootstrapParams, OsType, RunnerApplication};

const DEFAULT_USER: &str = "runner";
const RUNNER_ENV_DIR: &str = "/etc/gha-fleet";

#[derive(Debug, Serialize)]
pub struct DefaultUser {
    pub name: String,
    pub home: String,
    pub shell: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    pub sudo: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub default_user: DefaultUser,
}

#[derive(Debug, Serialize)]
pub struct WriteFile {
    pub encoding: String,
    pub content: String,
    pub owner: String,
    pub path: String,
    pub permissions: String,
}

/// Cloud-init document that makes a fresh instance register itself as a
/// runner. File contents are base64-encoded and deduplicated by path.
#[derive(Debug, Serialize)]
pub struct CloudInit {
    pub package_upgrade: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_info: Option<SystemInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub runcmd: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub write_files: Vec<WriteFile>,
}

impl CloudInit {
    pub fn new() -> Self {
        CloudInit {
            package_upgrade: true,
            packages: vec!["curl".into(), "tar".into()],
            ssh_authorized_keys: Vec::new(),
            system_info: Some(SystemInfo {
                default_user: DefaultUser {
                    name: DEFAULT_USER.into(),
                    home: format!("/home/{DEFAULT_USER}"),
                    shell: "/bin/bash".into(),
                    groups: vec!["sudo".into(), "adm".into()],
                    sudo: "ALL=(ALL) NOPASSWD:ALL".into(),
                },
            }),
            runcmd: Vec::new(),
            write_files: Vec::new(),
        }
    }

    pub fn add_package(&mut self, pkg: impl Into<String>) {
        let pkg = pkg.into();
        if !self.packages.contains(&pkg) {
            self.packages.push(pkg);
        }
    }

    pub fn add_ssh_key(&mut self, key: impl Into<String>) {
        let key = key.into();
        if !self.ssh_authorized_keys.contains(&key) {
            self.ssh_authorized_keys.push(key);
        }
    }

    pub fn add_run_cmd(&mut self, cmd: impl Into<String>) {
        self.runcmd.push(cmd.into());
    }

    /// First write wins for a given path.
    pub fn add_file(&mut self, contents: &[u8], path: &str, owner: &str, permissions: &str) {
        if self.write_files.iter().any(|f| f.path == path) {
            return;
        }
        self.write_files.push(WriteFile {
            encoding: "b64".into(),
            content: BASE64_STANDARD.encode(contents),
            owner: owner.into(),
            path: path.into(),
            permissions: permissions.into(),
        });
    }

    pub fn serialize(&self) -> Result<String> {
        let body = serde_yaml::to_string(self)
            .map_err(|e| Error::bad_request(format!("rendering cloud-init: {e}")))?;
        Ok(format!("#cloud-config\n{body}"))
    }
}

impl Default for CloudInit {
    fn default() -> Self {
        CloudInit::new()
    }
}

fn select_tool<'a>(bootstrap: &'a BootstrapParams) -> Result<&'a RunnerApplication> {
    let os = bootstrap.os_type.tool_os();
    let arch = bootstrap.os_arch.tool_arch();
    bootstrap
        .tools
        .iter()
        .find(|t| t.os == os && t.architecture == arch)
        .ok_or_else(|| Error::not_found(format!("no runner build for {os}/{arch}")))
}

/// Renders the user-data for one instance. JIT config takes precedence over
/// a registration token when both are present.
pub fn build_user_data(bootstrap: &BootstrapParams) -> Result<String> {
    if bootstrap.os_type != OsType::Linux {
        return Err(Error::bad_request(
            "only linux bootstrap is supported by the cloud-init builder",
        ));
    }
    let tool = select_tool(bootstrap)?;
    let checksum = tool
        .sha256_checksum
        .as_deref()
        .ok_or_else(|| Error::bad_request("runner download has no sha256 checksum"))?;

    let group_flag = bootstrap
        .github_runner_group
        .as_deref()
        .map(|g| format!("--runnergroup \"{g}\""))
        .unwrap_or_default();

    let template = include_str!("../scripts/install_runner.sh");
    let script = template
        .replace("___RUNNER_USER___", DEFAULT_USER)
        .replace("___FILENAME___", &tool.filename)
        .replace("___DOWNLOAD_URL___", &tool.download_url)
        .replace("___CHECKSUM___", checksum)
        .replace("___REPO_URL___", &bootstrap.repo_url)
        .replace("___RUNNER_NAME___", &bootstrap.name)
        .replace("___LABELS___", &bootstrap.labels.join(","))
        .replace("___GROUP_FLAG___", &group_flag);

    let env = format!(
        "CALLBACK_URL={}\nMETADATA_URL={}\nINSTANCE_TOKEN={}\n",
        bootstrap.callback_url, bootstrap.metadata_url, bootstrap.instance_token
    );

    let mut doc = CloudInit::new();
    doc.add_file(script.as_bytes(), "/install_runner.sh", "root:root", "0755");
    doc.add_file(
        env.as_bytes(),
        &format!("{RUNNER_ENV_DIR}/env"),
        "root:root",
        "0600",
    );
    if let Some(jit) = bootstrap.jit_config.as_deref() {
        doc.add_file(
            jit.as_bytes(),
            &format!("{RUNNER_ENV_DIR}/jit_config"),
            "root:root",
            "0600",
        );
    } else if let Some(token) = bootstrap.registration_token.as_deref() {
        doc.add_file(
            token.as_bytes(),
            &format!("{RUNNER_ENV_DIR}/registration_token"),
            "root:root",
            "0600",
        );
    } else {
        return Err(Error::bad_request(
            "bootstrap carries neither a jit config nor a registration token",
        ));
    }
    doc.add_run_cmd("/install_runner.sh");

    doc.serialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::OsArch;

    fn bootstrap(jit: Option<&str>, token: Option<&str>) -> BootstrapParams {
        BootstrapParams {
            name: "gha-abc123".into(),
            pool_id: "p1".into(),
            image: "ubuntu".into(),
            flavor: "small".into(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            labels: vec!["self-hosted".into(), "linux".into()],
            tools: vec![RunnerApplication {
                os: "linux".into(),
                architecture: "x64".into(),
                download_url: "https://example.com/runner.tar.gz".into(),
                filename: "runner.tar.gz".into(),
                sha256_checksum: Some("abc123".into()),
            }],
            repo_url: "https://github.com/acme".into(),
            callback_url: "https://fleet/api/v1/callbacks/status".into(),
            metadata_url: "https://fleet/api/v1/metadata".into(),
            instance_token: "itok".into(),
            jit_config: jit.map(String::from),
            registration_token: token.map(String::from),
            github_runner_group: None,
            extra_specs: serde_json::Value::Null,
            user_data: String::new(),
        }
    }

    #[test]
    fn jit_config_is_preferred_over_token() {
        let doc = build_user_data(&bootstrap(Some("JITBLOB"), Some("tok"))).unwrap();
        assert!(doc.starts_with("#cloud-config\n"));
        assert!(doc.contains("/etc/gha-fleet/jit_config"));
        assert!(!doc.contains("/etc/gha-fleet/registration_token"));
    }

    #[test]
    fn token_fallback_renders_the_config_path() {
        let doc = build_user_data(&bootstrap(None, Some("tok"))).unwrap();
        assert!(doc.contains("/etc/gha-fleet/registration_token"));
        let script = String::from_utf8(
            BASE64_STANDARD
                .decode(extract_content(&doc, "/install_runner.sh"))
                .unwrap(),
        )
        .unwrap();
        assert!(script.contains("--url \"https://github.com/acme\""));
        assert!(script.contains("--name \"gha-abc123\""));
        assert!(script.contains("--labels \"self-hosted,linux\""));
        assert!(script.contains("sha256sum --check"));
    }

    #[test]
    fn missing_credentials_is_an_error() {
        assert!(build_user_data(&bootstrap(None, None)).is_err());
    }

    #[test]
    fn missing_tool_build_is_an_error() {
        let mut b = bootstrap(Some("JIT"), None);
        b.os_arch = OsArch::Arm64;
        let err = build_user_data(&b).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn files_are_deduplicated_by_path() {
        let mut doc = CloudInit::new();
        doc.add_file(b"one", "/x", "root:root", "0644");
        doc.add_file(b"two", "/x", "root:root", "0644");
        assert_eq!(doc.write_files.len(), 1);
        assert_eq!(doc.write_files[0].content, BASE64_STANDARD.encode(b"one"));
    }

    // pulls the b64 content of one write_files entry out of the yaml
    fn extract_content(doc: &str, path: &str) -> String {
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            doc.strip_prefix("#cloud-config\n").unwrap(),
        )
        .unwrap();
        let files = yaml["write_files"].as_sequence().unwrap();
        files
            .iter()
            .find(|f| f["path"].as_str() == Some(path))
            .unwrap()["content"]
            .as_str()
            .unwrap()
            .to_string()
    }
}
