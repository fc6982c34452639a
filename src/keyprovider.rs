//! KeyProvider / Signer: abstracao de operacoes com chave privada
//!
//! `KeyProvider` extrai chaves RSA de PEM ou de um blob PKCS#12/PFX, nos
//! mesmos moldes de `CertificadoA1::private_key`/`from_bytes`. `Signer`
//! abstrai um colaborador externo (tipicamente PKCS#11) que assina
//! diretamente, incluindo seu proprio padding -- o crate nao traz nenhuma
//! implementacao PKCS#11, apenas o trait e um adaptador que encapsula
//! qualquer `KeyProvider` como `Signer`.

use base64::Engine;
use der::Decode;
use pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use x509_cert::Certificate;

use crate::error::{Result, XmlSigError};

/// Fonte de chaves RSA (par publico/privado) resolvida a partir de uma `KeySpec`.
pub trait KeyProvider {
    fn rsa_public_key(&self) -> Result<RsaPublicKey>;
    fn rsa_private_key(&self) -> Result<RsaPrivateKey>;
}

/// Colaborador externo que assina dados ja preparados (incluindo seu proprio
/// padding PKCS#1 v1.5), como um modulo PKCS#11. Tambem pode expor o
/// certificado associado, usado para popular `<KeyInfo>`.
pub trait Signer: Send + Sync {
    fn sign_raw(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn certificate_pem(&self) -> Option<String>;
}

/// Certificado ou chave privada em PEM (PKCS#8 ou PKCS#1 para a chave;
/// X.509 padrao para o certificado).
pub struct PemKeyProvider {
    pem: String,
}

impl PemKeyProvider {
    pub fn new(pem: impl Into<String>) -> Self {
        PemKeyProvider { pem: pem.into() }
    }
}

impl KeyProvider for PemKeyProvider {
    fn rsa_public_key(&self) -> Result<RsaPublicKey> {
        if let Ok(key) = RsaPublicKey::from_public_key_pem(&self.pem) {
            return Ok(key);
        }
        public_key_from_certificate_pem(&self.pem)
    }

    fn rsa_private_key(&self) -> Result<RsaPrivateKey> {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(&self.pem) {
            return Ok(key);
        }
        RsaPrivateKey::from_pkcs1_pem(&self.pem)
            .map_err(|e| XmlSigError::KeyNotFound(format!("PEM nao contem chave privada RSA valida: {e}")))
    }
}

fn public_key_from_certificate_pem(pem: &str) -> Result<RsaPublicKey> {
    let der = pem_to_der(pem)?;
    public_key_from_certificate_der(&der)
}

fn public_key_from_certificate_der(der: &[u8]) -> Result<RsaPublicKey> {
    let cert = Certificate::from_der(der)
        .map_err(|e| XmlSigError::KeyNotFound(format!("certificado X509 invalido: {e}")))?;
    let spki_der = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| XmlSigError::KeyNotFound(format!("SubjectPublicKeyInfo invalido: {e}")))?;
    RsaPublicKey::from_public_key_der(&spki_der)
        .map_err(|e| XmlSigError::KeyNotFound(format!("certificado nao contem chave RSA: {e}")))
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let body: String = pem
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("");
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| XmlSigError::KeyNotFound(format!("PEM base64 invalido: {e}")))
}

/// Blob PKCS#12/PFX em memoria, com certificado e chave privada extraidos
/// via `p12`, no mesmo caminho que `CertificadoA1::from_bytes` segue.
pub struct Pkcs12KeyProvider {
    cert_der: Vec<u8>,
    private_key_der: Vec<u8>,
}

impl Pkcs12KeyProvider {
    pub fn parse(pfx_der: &[u8], password: &str) -> Result<Self> {
        if pfx_der.len() < 10 || pfx_der[0] != 0x30 {
            return Err(XmlSigError::KeyNotFound("blob PKCS12 invalido ou pequeno demais".into()));
        }
        let pfx = p12::PFX::parse(pfx_der)
            .map_err(|e| XmlSigError::KeyNotFound(format!("falha ao interpretar PKCS12: {e:?}")))?;
        let certs = pfx
            .cert_bags(password)
            .map_err(|e| XmlSigError::KeyNotFound(format!("senha incorreta ou certificado ausente: {e:?}")))?;
        let keys = pfx
            .key_bags(password)
            .map_err(|e| XmlSigError::KeyNotFound(format!("chave privada ausente no PFX: {e:?}")))?;
        let cert_der = certs.into_iter().next().ok_or_else(|| XmlSigError::KeyNotFound("PFX sem certificado".into()))?;
        let private_key_der =
            keys.into_iter().next().ok_or_else(|| XmlSigError::KeyNotFound("PFX sem chave privada".into()))?;
        Ok(Pkcs12KeyProvider { cert_der, private_key_der })
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }
}

impl KeyProvider for Pkcs12KeyProvider {
    fn rsa_public_key(&self) -> Result<RsaPublicKey> {
        public_key_from_certificate_der(&self.cert_der)
    }

    fn rsa_private_key(&self) -> Result<RsaPrivateKey> {
        RsaPrivateKey::from_pkcs8_der(&self.private_key_der)
            .map_err(|e| XmlSigError::KeyNotFound(format!("chave PKCS8 invalida no PFX: {e}")))
    }
}

/// Encapsula qualquer `KeyProvider` como `Signer`, assinando via PKCS#1 v1.5
/// -- usado quando o chamador prefere tratar toda chave (local ou remota) de
/// forma uniforme atraves de `KeySpec::Signer`. `sign_raw` recebe o
/// `DigestInfo` ja prefixado (ver `orchestrator::sign`) e so cuida do
/// acolchoamento e da operacao privada, sem assumir qual hash foi usado --
/// por isso serve igualmente para rsa-sha1, rsa-sha256, rsa-sha384 e
/// rsa-sha512.
pub struct ProviderSigner<P: KeyProvider> {
    provider: P,
    certificate_pem: Option<String>,
}

impl<P: KeyProvider> ProviderSigner<P> {
    pub fn new(provider: P, certificate_pem: Option<String>) -> Self {
        ProviderSigner { provider, certificate_pem }
    }
}

impl<P: KeyProvider + Send + Sync> Signer for ProviderSigner<P> {
    fn sign_raw(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.provider.rsa_private_key()?;
        // `data` ja chega com o DigestInfo prefixado; `new_unprefixed` faz
        // apenas o acolchoamento PKCS#1 v1.5 sobre ele, sem adicionar um
        // segundo prefixo de algoritmo por conta propria.
        key.sign(Pkcs1v15Sign::new_unprefixed(), data)
            .map_err(|e| XmlSigError::KeyNotFound(format!("falha ao assinar: {e}")))
    }

    fn certificate_pem(&self) -> Option<String> {
        self.certificate_pem.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_to_der_strips_armor_and_decodes_base64() {
        let der = vec![0x30, 0x03, 0x02, 0x01, 0x01];
        let body = base64::engine::general_purpose::STANDARD.encode(&der);
        let pem = format!("-----BEGIN CERTIFICATE-----\n{body}\n-----END CERTIFICATE-----\n");
        let decoded = pem_to_der(&pem).unwrap();
        assert_eq!(decoded, der);
    }

    #[test]
    fn pkcs12_provider_rejects_non_pkcs12_bytes() {
        let err = Pkcs12KeyProvider::parse(b"not pkcs12", "pw").unwrap_err();
        assert!(matches!(err, XmlSigError::KeyNotFound(_)));
    }
}
