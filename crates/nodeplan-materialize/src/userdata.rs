//! Bootstrap user data per AMI family.
//!
//! The NodeClass may carry its own user data. Each family merges it with
//! the bootstrap that joins the node to the cluster:
//!
//! - AL2 and Ubuntu: a MIME multipart archive, custom parts first, then a
//!   `bootstrap.sh` part.
//! - AL2023: a MIME multipart archive ending in a nodeadm `NodeConfig`.
//! - Bottlerocket: one TOML document; cluster identity always wins, labels
//!   and taints are merged, other user settings are kept.
//! - Windows: a PowerShell block, custom script first.
//! - Custom: the user data exactly as given.
//!
//! Output is deterministic for equal inputs, so it can feed the NodeClass
//! hash without spurious drift.

use crate::{MaterializeError, MaterializeResult};
use nodeplan_api::{AmiFamily, KubeletConfiguration, Taint, TaintEffect};
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Boundary of generated MIME archives.
pub const MIME_BOUNDARY: &str = "//";

const SHELL_CONTENT_TYPE: &str = "text/x-shellscript; charset=\"us-ascii\"";
const NODEADM_CONTENT_TYPE: &str = "application/node.eks.aws";

static BOUNDARY_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?i)boundary="?([^";\n]+)"?"#).ok());

/// What the bootstrap needs to know about the cluster and the node.
#[derive(Debug, Clone)]
pub struct Bootstrap<'a> {
    pub cluster_name: &'a str,
    pub endpoint: Option<&'a str>,
    pub kubelet: &'a KubeletConfiguration,
    /// Labels the kubelet registers the node with.
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub max_pods: i64,
}

impl Bootstrap<'_> {
    /// Render the user data for `family`, merged with the NodeClass's own
    /// `custom` user data.
    pub fn render(&self, family: AmiFamily, custom: Option<&str>) -> MaterializeResult<Option<String>> {
        let custom = custom.filter(|c| !c.trim().is_empty());
        let rendered = match family {
            AmiFamily::Custom => return Ok(custom.map(str::to_string)),
            AmiFamily::AL2 | AmiFamily::Ubuntu => {
                let mut parts = custom.map(mime_parts).transpose()?.unwrap_or_default();
                parts.push(MimePart::shell(self.bootstrap_script()));
                mime_archive(&parts)
            }
            AmiFamily::AL2023 => {
                let mut parts = custom.map(mime_parts).transpose()?.unwrap_or_default();
                parts.push(MimePart {
                    content_type: NODEADM_CONTENT_TYPE.to_string(),
                    body: self.node_config()?,
                });
                mime_archive(&parts)
            }
            AmiFamily::Bottlerocket => self.bottlerocket_settings(custom)?,
            AmiFamily::Windows2019 | AmiFamily::Windows2022 => self.powershell(custom),
        };
        Ok(Some(rendered))
    }

    fn sorted_taints(&self) -> Vec<&Taint> {
        let mut taints: Vec<&Taint> = self.taints.iter().collect();
        taints.sort();
        taints.dedup();
        taints
    }

    /// Flags shared by the shell and PowerShell bootstraps.
    fn kubelet_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.labels.is_empty() {
            let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
            args.push(format!("--node-labels={}", labels.join(",")));
        }
        let taints = self.sorted_taints();
        if !taints.is_empty() {
            let taints: Vec<String> = taints.iter().map(|t| taint_arg(t)).collect();
            args.push(format!("--register-with-taints={}", taints.join(",")));
        }
        args.push(format!("--max-pods={}", self.max_pods));
        if !self.kubelet.eviction_hard.is_empty() {
            let entries: Vec<String> = self
                .kubelet
                .eviction_hard
                .iter()
                .map(|(signal, threshold)| format!("{signal}<{threshold}"))
                .collect();
            args.push(format!("--eviction-hard={}", entries.join(",")));
        }
        if let Some(high) = self.kubelet.image_gc_high_threshold_percent {
            args.push(format!("--image-gc-high-threshold={high}"));
        }
        if let Some(low) = self.kubelet.image_gc_low_threshold_percent {
            args.push(format!("--image-gc-low-threshold={low}"));
        }
        args
    }

    fn bootstrap_script(&self) -> String {
        let mut args = vec![format!("'{}'", self.cluster_name)];
        if let Some(endpoint) = self.endpoint {
            args.push(format!("--apiserver-endpoint '{endpoint}'"));
        }
        if let Some(dns) = self.kubelet.cluster_dns.first() {
            args.push(format!("--dns-cluster-ip '{dns}'"));
        }
        args.push("--use-max-pods false".to_string());
        args.push(format!("--kubelet-extra-args '{}'", self.kubelet_args().join(" ")));
        format!(
            "#!/bin/bash -xe\n\
             exec > >(tee /var/log/user-data.log|logger -t user-data -s 2>/dev/console) 2>&1\n\
             /etc/eks/bootstrap.sh {}\n",
            args.join(" ")
        )
    }

    fn node_config(&self) -> MaterializeResult<String> {
        let mut flags = Vec::new();
        if !self.labels.is_empty() {
            let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
            flags.push(format!("--node-labels={}", labels.join(",")));
        }
        let taints = self.sorted_taints();
        if !taints.is_empty() {
            let taints: Vec<String> = taints.iter().map(|t| taint_arg(t)).collect();
            flags.push(format!("--register-with-taints={}", taints.join(",")));
        }
        let mut kubelet_config = json!({ "maxPods": self.max_pods });
        if !self.kubelet.cluster_dns.is_empty() {
            kubelet_config["clusterDNS"] = json!(self.kubelet.cluster_dns);
        }
        if !self.kubelet.eviction_hard.is_empty() {
            kubelet_config["evictionHard"] = json!(self.kubelet.eviction_hard);
        }
        let config = json!({
            "apiVersion": "node.eks.aws/v1alpha1",
            "kind": "NodeConfig",
            "spec": {
                "cluster": {
                    "name": self.cluster_name,
                    "apiServerEndpoint": self.endpoint,
                },
                "kubelet": {
                    "config": kubelet_config,
                    "flags": flags,
                },
            },
        });
        // NodeConfig is YAML; JSON is a subset of it.
        serde_json::to_string_pretty(&config)
            .map_err(|e| MaterializeError::InvalidUserData(format!("node config: {e}")))
    }

    fn bottlerocket_settings(&self, custom: Option<&str>) -> MaterializeResult<String> {
        let mut doc: toml::Table = match custom {
            Some(custom) => toml::from_str(custom)
                .map_err(|e| MaterializeError::InvalidUserData(format!("bottlerocket settings: {e}")))?,
            None => toml::Table::new(),
        };
        let kubernetes = table_at(table_at(&mut doc, "settings")?, "kubernetes")?;

        kubernetes.insert("cluster-name".into(), self.cluster_name.into());
        if let Some(endpoint) = self.endpoint {
            kubernetes.insert("api-server".into(), endpoint.into());
        }
        if !kubernetes.contains_key("max-pods") {
            kubernetes.insert("max-pods".into(), self.max_pods.into());
        }
        if let Some(dns) = self.kubelet.cluster_dns.first() {
            kubernetes.entry("cluster-dns-ip").or_insert_with(|| dns.as_str().into());
        }

        let labels = table_at(kubernetes, "node-labels")?;
        for (key, value) in &self.labels {
            labels.insert(key.clone(), value.as_str().into());
        }

        let taints = table_at(kubernetes, "node-taints")?;
        for taint in self.sorted_taints() {
            let entry = format!("{}:{}", taint.value.as_deref().unwrap_or_default(), effect_name(taint.effect));
            let values = taints
                .entry(taint.key.clone())
                .or_insert_with(|| toml::Value::Array(Vec::new()));
            let toml::Value::Array(values) = values else {
                return Err(MaterializeError::InvalidUserData(format!(
                    "bottlerocket settings: node-taints.{} is not an array",
                    taint.key
                )));
            };
            if !values.iter().any(|v| v.as_str() == Some(entry.as_str())) {
                values.push(entry.into());
            }
        }
        if labels_empty(kubernetes, "node-labels") {
            kubernetes.remove("node-labels");
        }
        if labels_empty(kubernetes, "node-taints") {
            kubernetes.remove("node-taints");
        }

        toml::to_string(&doc).map_err(|e| MaterializeError::InvalidUserData(format!("bottlerocket settings: {e}")))
    }

    fn powershell(&self, custom: Option<&str>) -> String {
        let mut out = String::from("<powershell>\n");
        if let Some(custom) = custom {
            let custom = custom
                .trim()
                .trim_start_matches("<powershell>")
                .trim_end_matches("</powershell>")
                .trim();
            out.push_str(custom);
            out.push('\n');
        }
        out.push_str("[string]$EKSBootstrapScriptFile = \"$env:ProgramFiles\\Amazon\\EKS\\Start-EKSBootstrap.ps1\"\n");
        out.push_str(&format!("& $EKSBootstrapScriptFile -EKSClusterName '{}'", self.cluster_name));
        if let Some(endpoint) = self.endpoint {
            out.push_str(&format!(" -APIServerEndpoint '{endpoint}'"));
        }
        if let Some(dns) = self.kubelet.cluster_dns.first() {
            out.push_str(&format!(" -DNSClusterIP '{dns}'"));
        }
        out.push_str(&format!(" -KubeletExtraArgs '{}'\n", self.kubelet_args().join(" ")));
        out.push_str("</powershell>");
        out
    }
}

fn effect_name(effect: TaintEffect) -> &'static str {
    match effect {
        TaintEffect::NoSchedule => "NoSchedule",
        TaintEffect::PreferNoSchedule => "PreferNoSchedule",
        TaintEffect::NoExecute => "NoExecute",
    }
}

fn taint_arg(taint: &Taint) -> String {
    format!(
        "{}={}:{}",
        taint.key,
        taint.value.as_deref().unwrap_or_default(),
        effect_name(taint.effect)
    )
}

/// The table under `key`, created when missing.
fn table_at<'a>(table: &'a mut toml::Table, key: &str) -> MaterializeResult<&'a mut toml::Table> {
    let value = table
        .entry(key.to_string())
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    match value {
        toml::Value::Table(inner) => Ok(inner),
        _ => Err(MaterializeError::InvalidUserData(format!(
            "bottlerocket settings: {key} is not a table"
        ))),
    }
}

fn labels_empty(table: &toml::Table, key: &str) -> bool {
    table.get(key).and_then(toml::Value::as_table).is_some_and(toml::Table::is_empty)
}

// ── MIME ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimePart {
    pub content_type: String,
    pub body: String,
}

impl MimePart {
    fn shell(body: String) -> Self {
        Self {
            content_type: SHELL_CONTENT_TYPE.to_string(),
            body,
        }
    }
}

/// Split custom user data into MIME parts. Anything that is not a MIME
/// archive is a single shell script part.
pub fn mime_parts(custom: &str) -> MaterializeResult<Vec<MimePart>> {
    let custom = custom.replace("\r\n", "\n");
    if !custom.trim_start().starts_with("MIME-Version:") {
        return Ok(vec![MimePart::shell(custom)]);
    }
    let (headers, body) = custom
        .split_once("\n\n")
        .ok_or_else(|| MaterializeError::InvalidUserData("MIME archive without a body".to_string()))?;
    let boundary = BOUNDARY_RE
        .as_ref()
        .and_then(|re| re.captures(headers))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .ok_or_else(|| MaterializeError::InvalidUserData("MIME archive without a boundary".to_string()))?;

    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    // The preamble before the first delimiter is discarded.
    for chunk in body.split(delimiter.as_str()).skip(1) {
        if chunk.starts_with("--") {
            break;
        }
        let chunk = chunk.strip_prefix('\n').unwrap_or(chunk);
        let (part_headers, part_body) = chunk.split_once("\n\n").unwrap_or((chunk, ""));
        let content_type = part_headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim().eq_ignore_ascii_case("content-type").then(|| value.trim().to_string())
            })
            .unwrap_or_else(|| SHELL_CONTENT_TYPE.to_string());
        parts.push(MimePart {
            content_type,
            body: part_body.trim_end_matches('\n').to_string() + "\n",
        });
    }
    if parts.is_empty() {
        return Err(MaterializeError::InvalidUserData(
            "MIME archive holds no parts".to_string(),
        ));
    }
    Ok(parts)
}

fn mime_archive(parts: &[MimePart]) -> String {
    let mut out = format!("MIME-Version: 1.0\nContent-Type: multipart/mixed; boundary=\"{MIME_BOUNDARY}\"\n\n");
    for part in parts {
        out.push_str(&format!("--{MIME_BOUNDARY}\nContent-Type: {}\n\n", part.content_type));
        out.push_str(&part.body);
        if !part.body.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push_str(&format!("--{MIME_BOUNDARY}--\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_kubelet() -> KubeletConfiguration {
        KubeletConfiguration {
            cluster_dns: vec!["10.100.0.10".to_string()],
            ..Default::default()
        }
    }

    fn make_bootstrap(kubelet: &KubeletConfiguration) -> Bootstrap<'_> {
        Bootstrap {
            cluster_name: "prod",
            endpoint: Some("https://prod.eks.example.com"),
            kubelet,
            labels: BTreeMap::from([
                ("karpenter.sh/nodepool".to_string(), "default".to_string()),
                ("tier".to_string(), "web".to_string()),
            ]),
            taints: vec![Taint {
                key: "dedicated".into(),
                value: Some("web".into()),
                effect: TaintEffect::NoSchedule,
            }],
            max_pods: 58,
        }
    }

    #[test]
    fn al2_wraps_custom_script_and_bootstrap() {
        let kubelet = make_kubelet();
        let out = make_bootstrap(&kubelet)
            .render(AmiFamily::AL2, Some("#!/bin/bash\necho hello"))
            .unwrap()
            .unwrap();
        assert!(out.starts_with("MIME-Version: 1.0\nContent-Type: multipart/mixed; boundary=\"//\""));
        assert!(out.ends_with("--//--\n"));

        let parts = mime_parts(&out).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].body, "#!/bin/bash\necho hello\n");
        let bootstrap = &parts[1].body;
        assert!(bootstrap.contains("/etc/eks/bootstrap.sh 'prod' --apiserver-endpoint 'https://prod.eks.example.com'"));
        assert!(bootstrap.contains("--dns-cluster-ip '10.100.0.10'"));
        assert!(bootstrap.contains("--node-labels=karpenter.sh/nodepool=default,tier=web"));
        assert!(bootstrap.contains("--register-with-taints=dedicated=web:NoSchedule"));
        assert!(bootstrap.contains("--max-pods=58"));
    }

    #[test]
    fn al2_keeps_parts_of_custom_archive() {
        let custom = "MIME-Version: 1.0\r\nContent-Type: multipart/mixed; boundary=\"BOUNDARY\"\r\n\r\n\
                      --BOUNDARY\r\nContent-Type: text/cloud-config\r\n\r\npackages: [jq]\r\n\
                      --BOUNDARY\r\nContent-Type: text/x-shellscript\r\n\r\necho custom\r\n--BOUNDARY--\r\n";
        let kubelet = make_kubelet();
        let out = make_bootstrap(&kubelet).render(AmiFamily::AL2, Some(custom)).unwrap().unwrap();
        let parts = mime_parts(&out).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].content_type, "text/cloud-config");
        assert_eq!(parts[0].body, "packages: [jq]\n");
        assert_eq!(parts[1].body, "echo custom\n");
        assert!(parts[2].body.contains("/etc/eks/bootstrap.sh"));
    }

    #[test]
    fn archive_without_boundary_is_rejected() {
        let err = mime_parts("MIME-Version: 1.0\nContent-Type: multipart/mixed\n\nbody").unwrap_err();
        assert!(matches!(err, MaterializeError::InvalidUserData(_)));
    }

    #[test]
    fn al2023_ends_with_node_config() {
        let kubelet = make_kubelet();
        let out = make_bootstrap(&kubelet).render(AmiFamily::AL2023, None).unwrap().unwrap();
        let parts = mime_parts(&out).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content_type, NODEADM_CONTENT_TYPE);
        let config: serde_json::Value = serde_json::from_str(&parts[0].body).unwrap();
        assert_eq!(config["kind"], "NodeConfig");
        assert_eq!(config["spec"]["cluster"]["name"], "prod");
        assert_eq!(config["spec"]["kubelet"]["config"]["maxPods"], 58);
        assert_eq!(config["spec"]["kubelet"]["config"]["clusterDNS"][0], "10.100.0.10");
    }

    #[test]
    fn bottlerocket_merges_settings() {
        let custom = r#"
[settings.kubernetes]
cluster-name = "spoofed"
max-pods = 20

[settings.kubernetes.node-labels]
team = "payments"
tier = "batch"

[settings.host-containers.admin]
enabled = true
"#;
        let kubelet = make_kubelet();
        let out = make_bootstrap(&kubelet)
            .render(AmiFamily::Bottlerocket, Some(custom))
            .unwrap()
            .unwrap();
        let doc: toml::Table = toml::from_str(&out).unwrap();
        let k8s = doc["settings"]["kubernetes"].as_table().unwrap();
        assert_eq!(k8s["cluster-name"].as_str(), Some("prod"));
        assert_eq!(k8s["api-server"].as_str(), Some("https://prod.eks.example.com"));
        assert_eq!(k8s["max-pods"].as_integer(), Some(20));
        assert_eq!(k8s["cluster-dns-ip"].as_str(), Some("10.100.0.10"));
        assert_eq!(k8s["node-labels"]["team"].as_str(), Some("payments"));
        assert_eq!(k8s["node-labels"]["tier"].as_str(), Some("web"));
        assert_eq!(k8s["node-taints"]["dedicated"][0].as_str(), Some("web:NoSchedule"));
        assert_eq!(doc["settings"]["host-containers"]["admin"]["enabled"].as_bool(), Some(true));
    }

    #[test]
    fn bottlerocket_rejects_bad_toml() {
        let kubelet = make_kubelet();
        let err = make_bootstrap(&kubelet)
            .render(AmiFamily::Bottlerocket, Some("[settings"))
            .unwrap_err();
        assert!(matches!(err, MaterializeError::InvalidUserData(_)));
    }

    #[test]
    fn windows_and_custom_families() {
        let kubelet = make_kubelet();
        let bootstrap = make_bootstrap(&kubelet);
        let ps = bootstrap
            .render(AmiFamily::Windows2022, Some("<powershell>Write-Host hi</powershell>"))
            .unwrap()
            .unwrap();
        assert!(ps.starts_with("<powershell>\nWrite-Host hi\n"));
        assert!(ps.contains("-EKSClusterName 'prod' -APIServerEndpoint 'https://prod.eks.example.com'"));
        assert!(ps.ends_with("</powershell>"));

        assert_eq!(
            bootstrap.render(AmiFamily::Custom, Some("raw")).unwrap().as_deref(),
            Some("raw")
        );
        assert_eq!(bootstrap.render(AmiFamily::Custom, None).unwrap(), None);
    }

    #[test]
    fn rendering_is_deterministic() {
        let kubelet = make_kubelet();
        let mut reordered = make_bootstrap(&kubelet);
        reordered.taints.insert(
            0,
            Taint {
                key: "zeta".into(),
                value: None,
                effect: TaintEffect::NoExecute,
            },
        );
        let mut original = make_bootstrap(&kubelet);
        original.taints.push(Taint {
            key: "zeta".into(),
            value: None,
            effect: TaintEffect::NoExecute,
        });
        assert_eq!(
            original.render(AmiFamily::AL2, None).unwrap(),
            reordered.render(AmiFamily::AL2, None).unwrap()
        );
    }
}
