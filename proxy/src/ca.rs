use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{PrivateKey, ServerConfig};
use tracing::debug;

use moat_common::{Error, ErrorKind};

const ROOT_COMMON_NAME: &str = "Moat Local CA";
const ROOT_VALIDITY_DAYS: i64 = 3650;
pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";

/// Ephemeral root CA with an on-demand, per-SNI leaf cache.
///
/// The root is trusted only inside the run's container (the cert is
/// mounted read-only and pointed at by `SSL_CERT_FILE`); it is never
/// installed into the host OS.
pub struct CertificateAuthority {
    root: Certificate,
    root_der: Vec<u8>,
    root_pem: String,
    leafs: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertificateAuthority {
    pub fn generate() -> Result<Self, Error> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ROOT_COMMON_NAME);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(ROOT_VALIDITY_DAYS);

        let root = Certificate::from_params(params)
            .map_err(|err| Error::source(ErrorKind::Internal, err))?;
        let root_der = root
            .serialize_der()
            .map_err(|err| Error::source(ErrorKind::Internal, err))?;
        let root_pem = root
            .serialize_pem()
            .map_err(|err| Error::source(ErrorKind::Internal, err))?;
        Ok(Self {
            root,
            root_der,
            root_pem,
            leafs: Mutex::new(HashMap::new()),
        })
    }

    /// Load the CA persisted under `dir`, or generate and persist one.
    pub fn load_or_generate(dir: &Path) -> Result<Self, Error> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path)?;
            let key_pem = fs::read_to_string(&key_path)?;
            let key_pair = KeyPair::from_pem(&key_pem)
                .map_err(|err| Error::source(ErrorKind::Internal, err))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)
                .map_err(|err| Error::source(ErrorKind::Internal, err))?;
            let root = Certificate::from_params(params)
                .map_err(|err| Error::source(ErrorKind::Internal, err))?;
            let root_der = root
                .serialize_der()
                .map_err(|err| Error::source(ErrorKind::Internal, err))?;
            return Ok(Self {
                root,
                root_der,
                root_pem: cert_pem,
                leafs: Mutex::new(HashMap::new()),
            });
        }

        let ca = Self::generate()?;
        ca.persist(dir)?;
        Ok(ca)
    }

    /// Write `ca.crt`/`ca.key` under `dir`. The cert must exist on disk
    /// before any container that mounts it is started.
    pub fn persist(&self, dir: &Path) -> Result<(), Error> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(CA_CERT_FILE), &self.root_pem)?;

        let key_pem = self.root.serialize_private_key_pem();
        let key_path = dir.join(CA_KEY_FILE);
        fs::write(&key_path, key_pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn cert_pem(&self) -> &str {
        &self.root_pem
    }

    /// The leaf for `sni`, minted on first use and cached for the life of
    /// the proxy.
    pub fn leaf_for(&self, sni: &str) -> Result<Arc<CertifiedKey>, Error> {
        {
            let leafs = self.leafs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(leaf) = leafs.get(sni) {
                return Ok(Arc::clone(leaf));
            }
        }

        debug!(%sni, "minting leaf certificate");
        let leaf = Arc::new(self.mint_leaf(sni)?);
        self.leafs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sni.to_string(), Arc::clone(&leaf));
        Ok(leaf)
    }

    fn mint_leaf(&self, sni: &str) -> Result<CertifiedKey, Error> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, sni);
        params.distinguished_name = dn;

        if let Ok(ip) = sni.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(sni.to_string()));
        }
        if sni == "localhost" || sni.ends_with(".localhost") {
            params
                .subject_alt_names
                .push(SanType::DnsName("localhost".to_string()));
            params
                .subject_alt_names
                .push(SanType::IpAddress(IpAddr::from([127, 0, 0, 1])));
        }

        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(397);

        let leaf = Certificate::from_params(params)
            .map_err(|err| Error::source(ErrorKind::Internal, err))?;
        let leaf_der = leaf
            .serialize_der_with_signer(&self.root)
            .map_err(|err| Error::source(ErrorKind::Internal, err))?;
        let key_der = leaf.serialize_private_key_der();

        let signing_key = rustls::sign::any_supported_type(&PrivateKey(key_der))
            .map_err(|err| Error::source(ErrorKind::Internal, err))?;
        Ok(CertifiedKey::new(
            vec![
                rustls::Certificate(leaf_der),
                rustls::Certificate(self.root_der.clone()),
            ],
            signing_key,
        ))
    }

    /// A rustls server config that answers every SNI with a CA-signed
    /// leaf.
    pub fn server_config(self: &Arc<Self>) -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(CaCertResolver(Arc::clone(self))));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }
}

struct CaCertResolver(Arc<CertificateAuthority>);

impl ResolvesServerCert for CaCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        self.0.leaf_for(sni).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leafs_are_cached_by_sni() -> anyhow::Result<()> {
        let ca = CertificateAuthority::generate()?;
        let first = ca.leaf_for("api.github.com")?;
        let second = ca.leaf_for("api.github.com")?;
        assert!(Arc::ptr_eq(&first, &second));

        let other = ca.leaf_for("api.anthropic.com")?;
        assert!(!Arc::ptr_eq(&first, &other));
        Ok(())
    }

    #[test]
    fn root_pem_has_the_expected_shape() -> anyhow::Result<()> {
        let ca = CertificateAuthority::generate()?;
        assert!(ca.cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));
        Ok(())
    }

    #[test]
    fn persists_and_reloads_the_same_root() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let first = CertificateAuthority::load_or_generate(dir.path())?;
        let second = CertificateAuthority::load_or_generate(dir.path())?;
        assert_eq!(first.cert_pem(), second.cert_pem());
        assert!(dir.path().join(CA_CERT_FILE).exists());
        assert!(dir.path().join(CA_KEY_FILE).exists());
        Ok(())
    }

    #[test]
    fn leaf_chain_contains_leaf_and_root() -> anyhow::Result<()> {
        let ca = CertificateAuthority::generate()?;
        let leaf = ca.leaf_for("example.com")?;
        assert_eq!(leaf.cert.len(), 2);
        Ok(())
    }
}
