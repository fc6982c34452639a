//! Indice de Certificados
//!
//! Varre um documento assinado em busca de `{xmldsig}X509Certificate` e indexa
//! cada um pelo fingerprint SHA-1 do corpo DER, no mesmo formato
//! (minusculas, pares de dois digitos separados por `:`) que `CertificadoA1`
//! ja usa para exibir certificados ao operador.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::{Result, XmlSigError};
use crate::keyspec::KeySpec;
use crate::tree::{NodeId, Tree, DSIG_NS};

const PEM_HEADER: &str = "-----BEGIN CERTIFICATE-----";
const PEM_FOOTER: &str = "-----END CERTIFICATE-----";

/// Mapeamento fingerprint -> corpo base64 (sem armadura PEM) de cada
/// `X509Certificate` encontrado em um documento.
pub struct CertificateIndex {
    entries: Vec<(String, String)>,
}

impl CertificateIndex {
    /// Varre todo o documento (nao apenas a `Signature` corrente) em ordem,
    /// coletando todo `{xmldsig}X509Certificate`.
    pub fn scan(tree: &Tree) -> Result<CertificateIndex> {
        let mut entries = Vec::new();
        for node in tree.find_descendants(tree.root, Some(DSIG_NS), "X509Certificate") {
            let body = cert_text(tree, node)?;
            let der = BASE64
                .decode(body.trim())
                .map_err(|e| XmlSigError::CanonicalizationError(format!("X509Certificate base64 invalido: {e}")))?;
            entries.push((fingerprint_hex(&der), body.trim().to_string()));
        }
        Ok(CertificateIndex { entries })
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<&str> {
        let wanted = fingerprint.to_ascii_lowercase();
        self.entries.iter().find(|(fp, _)| fp == &wanted).map(|(_, body)| body.as_str())
    }
}

fn cert_text(tree: &Tree, node: NodeId) -> Result<String> {
    tree.node(node)
        .text
        .clone()
        .ok_or_else(|| XmlSigError::MissingElement("X509Certificate".into()))
}

/// SHA-1 do DER em 40 digitos hex minusculos, separados em pares por `:`.
pub fn fingerprint_hex(der: &[u8]) -> String {
    let digest = Sha1::digest(der);
    hex::encode(digest)
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap())
        .collect::<Vec<_>>()
        .join(":")
}

fn wrap_pem(body: &str) -> String {
    format!("{PEM_HEADER}\n{body}\n{PEM_FOOTER}\n")
}

/// Resolve uma `KeySpec` para um corpo PEM de certificado, conforme §4.5:
/// caminho de arquivo > fingerprint (contra o indice do documento) > PEM cru.
pub fn resolve_cert(tree: &Tree, keyspec: &KeySpec) -> Result<String> {
    match keyspec {
        KeySpec::Path(path) => {
            if Path::new(path).is_file() {
                std::fs::read_to_string(path).map_err(XmlSigError::Io)
            } else {
                Err(XmlSigError::KeyNotFound(path.clone()))
            }
        }
        KeySpec::Fingerprint(fp) => {
            let index = CertificateIndex::scan(tree)?;
            index
                .lookup(fp)
                .map(wrap_pem)
                .ok_or_else(|| XmlSigError::KeyNotFound(fp.clone()))
        }
        KeySpec::Pem(pem) => Ok(pem.clone()),
        KeySpec::Signer(signer) => signer
            .certificate_pem()
            .ok_or_else(|| XmlSigError::KeyNotFound("signer nao possui certificado associado".into())),
        KeySpec::Pkcs12 { .. } => {
            Err(XmlSigError::KeyNotFound("KeySpec::Pkcs12 nao fornece certificado via resolve_cert; use o DER embutido no PFX".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_lowercase_colon_separated() {
        let fp = fingerprint_hex(b"hello world");
        assert_eq!(fp.len(), 59); // 20 bytes -> 40 hex chars + 19 colons
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() || c == ':'));
        assert_eq!(fp, fp.to_ascii_lowercase());
    }

    #[test]
    fn scan_indexes_embedded_certificate_by_fingerprint() {
        let der = b"not a real certificate but any bytes work for the digest";
        let body = BASE64.encode(der);
        let xml = format!(
            r#"<Root xmlns:ds="{ns}"><ds:X509Certificate>{body}</ds:X509Certificate></Root>"#,
            ns = DSIG_NS
        );
        let tree = Tree::parse(&xml).unwrap();
        let index = CertificateIndex::scan(&tree).unwrap();
        let fp = fingerprint_hex(der);
        assert_eq!(index.lookup(&fp), Some(body.as_str()));
    }

    #[test]
    fn resolve_cert_via_fingerprint_wraps_pem_armor() {
        let der = b"certificate bytes for armor test";
        let body = BASE64.encode(der);
        let xml = format!(
            r#"<Root xmlns:ds="{ns}"><ds:X509Certificate>{body}</ds:X509Certificate></Root>"#,
            ns = DSIG_NS
        );
        let tree = Tree::parse(&xml).unwrap();
        let fp = fingerprint_hex(der);
        let pem = resolve_cert(&tree, &KeySpec::Fingerprint(fp)).unwrap();
        assert!(pem.starts_with(PEM_HEADER));
        assert!(pem.contains(&body));
    }

    #[test]
    fn resolve_cert_unknown_fingerprint_fails() {
        let tree = Tree::parse("<Root/>").unwrap();
        let err = resolve_cert(&tree, &KeySpec::Fingerprint("aa:bb".into())).unwrap_err();
        assert!(matches!(err, XmlSigError::KeyNotFound(_)));
    }
}
