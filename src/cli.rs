use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kubedoor")]
#[command(about = "Kubernetes peak-aware governance and admission control")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the coordinator: the control-plane hub agents dial into.
    Coordinator,

    /// Run the per-cluster agent.
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
}

#[derive(Subcommand)]
pub enum AgentAction {
    /// Start the agent's admission webhook and coordinator link.
    Serve,

    /// Generate self-signed TLS certificates for the admission webhook.
    CertGenerate {
        #[arg(long, default_value = "kubedoor-agent")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: String,
    },
}

/// Self-signed CA + leaf certificate for the agent's admission webhook
/// HTTPS listener. Ported from the donor webhook command's cert-gen path.
pub fn generate_certs(service_name: &str, namespace: &str, output_dir: &str) -> anyhow::Result<()> {
    use anyhow::Context;
    use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, BasicConstraints, KeyPair, SanType};

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "kubedoor-webhook-ca");
    ca_params.distinguished_name = ca_dn;
    let ca_key = KeyPair::generate().context("failed to generate CA key pair")?;
    let ca_cert = ca_params.self_signed(&ca_key).context("failed to self-sign CA certificate")?;

    let mut server_params = CertificateParams::default();
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::CommonName, format!("{service_name}.{namespace}.svc"));
    server_params.distinguished_name = server_dn;
    server_params.subject_alt_names = vec![
        SanType::DnsName(format!("{service_name}.{namespace}.svc").try_into().context("invalid DNS SAN")?),
        SanType::DnsName(format!("{service_name}.{namespace}.svc.cluster.local").try_into().context("invalid DNS SAN")?),
    ];
    let server_key = KeyPair::generate().context("failed to generate server key pair")?;
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).context("failed to sign server certificate")?;

    let output_path = std::path::Path::new(output_dir);
    std::fs::create_dir_all(output_path).context("failed to create output directory")?;
    std::fs::write(output_path.join("ca.crt"), ca_cert.pem()).context("failed to write ca.crt")?;
    std::fs::write(output_path.join("tls.crt"), server_cert.pem()).context("failed to write tls.crt")?;
    std::fs::write(output_path.join("tls.key"), server_key.serialize_pem()).context("failed to write tls.key")?;

    println!("Wrote ca.crt, tls.crt, tls.key to {output_dir}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_certs_writes_three_pem_files() {
        let dir = std::env::temp_dir().join("kubedoor-test-certgen");
        let _ = std::fs::remove_dir_all(&dir);
        generate_certs("svc", "ns", dir.to_str().unwrap()).unwrap();
        assert!(dir.join("ca.crt").exists());
        assert!(dir.join("tls.crt").exists());
        assert!(dir.join("tls.key").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
