//! Orquestrador: pontos de entrada `sign`/`verify`
//!
//! Junta Processador de Referencias, Canonicalizador, Codec e
//! KeyProvider/Signer no fluxo completo de assinatura/verificacao,
//! generalizando o caminho unico e fixo de `assinatura.rs` (sempre
//! enveloped + exclusive-c14n + RSA-SHA256) para qualquer combinacao
//! suportada pelas tabelas de algoritmo do motor.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};

use crate::cert::resolve_cert;
use crate::codec::{build_digest_info, build_signed_block};
use crate::error::{Result, XmlSigError};
use crate::keyprovider::{KeyProvider, PemKeyProvider, Pkcs12KeyProvider, Signer};
use crate::keyspec::KeySpec;
use crate::reference::{digest_bytes, process_references, DIGEST_SHA1, DIGEST_SHA256, DIGEST_SHA384, DIGEST_SHA512};
use crate::template::{append_key_info, append_signature_value, build_signature_template, TemplateOptions};
use crate::tree::{NodeId, Tree, DSIG_NS};

/// Assinatura / Verificacao operam sobre um conjunto configuravel de nomes
/// de atributo que contam como "ID" ao resolver URIs `#fragment`, em vez de
/// uma lista global mutavel.
#[derive(Clone)]
pub struct VerifyOptions {
    pub id_attributes: Vec<String>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        VerifyOptions { id_attributes: vec!["ID".to_string(), "id".to_string()] }
    }
}

#[derive(Clone)]
pub struct SignOptions {
    pub id_attributes: Vec<String>,
    /// Certificado PEM a embutir em `<KeyInfo>`. Obrigatorio para
    /// `KeySpec::Path`/`Pem`/`Signer` sem certificado proprio; ignorado (o
    /// certificado do PFX e usado) para `KeySpec::Pkcs12`.
    pub cert_pem: Option<String>,
    /// Usado apenas quando o documento ainda nao possui `<Signature>`.
    pub template: TemplateOptions,
}

impl Default for SignOptions {
    fn default() -> Self {
        SignOptions { id_attributes: vec!["ID".to_string(), "id".to_string()], cert_pem: None, template: TemplateOptions::default() }
    }
}

fn hash_name_for_digest_uri(uri: &str) -> Result<&'static str> {
    match uri {
        DIGEST_SHA1 => Ok(DIGEST_SHA1),
        DIGEST_SHA256 => Ok(DIGEST_SHA256),
        DIGEST_SHA384 => Ok(DIGEST_SHA384),
        DIGEST_SHA512 => Ok(DIGEST_SHA512),
        other => Err(XmlSigError::UnknownTransform(other.to_string())),
    }
}

/// Deriva o digest exigido por um `SignatureMethod/@Algorithm` (`rsa-sha1`,
/// `rsa-sha256`, ...), devolvendo o URI de `DigestMethod` correspondente.
fn signature_method_to_digest_uri(algorithm: &str) -> Result<&'static str> {
    if algorithm.ends_with("rsa-sha1") {
        Ok(DIGEST_SHA1)
    } else if algorithm.ends_with("rsa-sha256") {
        Ok(DIGEST_SHA256)
    } else if algorithm.ends_with("rsa-sha384") {
        Ok(DIGEST_SHA384)
    } else if algorithm.ends_with("rsa-sha512") {
        Ok(DIGEST_SHA512)
    } else {
        Err(XmlSigError::UnknownTransform(algorithm.to_string()))
    }
}

fn read_algorithm_attr(tree: &Tree, elem: NodeId, local: &str) -> Result<String> {
    let target = tree
        .find_first_descendant(elem, Some(DSIG_NS), local)
        .ok_or_else(|| XmlSigError::MissingElement(local.to_string()))?;
    tree.node(target)
        .as_element()
        .and_then(|(_, attrs)| attrs.iter().find(|(n, _)| n.local == "Algorithm"))
        .map(|(_, v)| v.clone())
        .ok_or_else(|| XmlSigError::MissingElement(format!("{local}/@Algorithm")))
}

fn element_text(tree: &Tree, elem: NodeId) -> String {
    tree.node(elem).text.clone().unwrap_or_default()
}

/// RSA cru: `base^exp mod modulus`, devolvido em big-endian com o mesmo
/// numero de bytes do modulo (zero-padded a esquerda se necessario). Usado
/// tanto para a operacao publica (verify) quanto privada (sign), no lugar
/// das rotinas de alto nivel do crate `rsa`, para comparar byte a byte com o
/// bloco PKCS#1 montado manualmente em `codec.rs`.
fn rsa_raw(base: &[u8], exponent: &BigUint, modulus: &BigUint, out_len: usize) -> Vec<u8> {
    let c = BigUint::from_bytes_be(base);
    let m = c.modpow(exponent, modulus);
    let mut bytes = m.to_bytes_be();
    if bytes.len() < out_len {
        let mut padded = vec![0u8; out_len - bytes.len()];
        padded.extend_from_slice(&bytes);
        bytes = padded;
    }
    bytes
}

fn public_key_size_bytes(key: &RsaPublicKey) -> usize {
    key.size()
}

/// Verifica todas as `<Signature>` do documento. `Ok(false)` somente quando
/// nao ha nenhuma; qualquer falha de verificacao e `Err`.
pub fn verify(doc: &Tree, key_spec: &KeySpec, opts: &VerifyOptions) -> Result<bool> {
    let signatures = doc.find_descendants(doc.root, Some(DSIG_NS), "Signature");
    if signatures.is_empty() {
        debug!("nenhuma Signature encontrada no documento");
        return Ok(false);
    }

    for signature in signatures {
        let signed_info = doc
            .find_first_descendant(signature, Some(DSIG_NS), "SignedInfo")
            .ok_or_else(|| XmlSigError::MissingElement("SignedInfo".into()))?;
        let signature_value = doc
            .find_first_descendant(signature, Some(DSIG_NS), "SignatureValue")
            .ok_or_else(|| XmlSigError::MissingElement("SignatureValue".into()))?;
        let sig_bytes = BASE64
            .decode(element_text(doc, signature_value).trim())
            .map_err(|e| XmlSigError::CanonicalizationError(format!("SignatureValue base64 invalido: {e}")))?;

        let public_key = resolve_public_key(doc, key_spec)?;

        let mut scratch = doc.clone();
        process_references(&mut scratch, signed_info, &opts.id_attributes)?;

        let c14n_method = read_algorithm_attr(&scratch, signed_info, "CanonicalizationMethod")?;
        let exclusive = c14n_method.contains("exc-c14n");
        let with_comments = c14n_method.contains("WithComments");
        let c14n_bytes = crate::canon::canonicalize(&scratch, signed_info, exclusive, with_comments, &[])?;

        let sig_method = read_algorithm_attr(&scratch, signed_info, "SignatureMethod")?;
        let digest_uri = signature_method_to_digest_uri(&sig_method)?;
        let si_digest = digest_bytes(digest_uri, &c14n_bytes)?;

        let key_size = public_key_size_bytes(&public_key);
        let expected = build_signed_block(digest_uri, &si_digest, key_size, true)?;
        let actual = rsa_raw(&sig_bytes, public_key.e(), public_key.n(), key_size);

        if expected != actual {
            warn!("assinatura nao confere para Signature em {signature}");
            return Err(XmlSigError::SignatureMismatch);
        }
        debug!("Signature em {signature} verificada com {digest_uri}");
    }
    Ok(true)
}

fn resolve_public_key(doc: &Tree, key_spec: &KeySpec) -> Result<RsaPublicKey> {
    match key_spec {
        KeySpec::Pkcs12 { der, password } => Pkcs12KeyProvider::parse(der, password)?.rsa_public_key(),
        KeySpec::Signer(signer) => {
            let pem = signer
                .certificate_pem()
                .ok_or_else(|| XmlSigError::KeyNotFound("signer nao possui certificado associado".into()))?;
            PemKeyProvider::new(pem).rsa_public_key()
        }
        _ => {
            let pem = resolve_cert(doc, key_spec)?;
            PemKeyProvider::new(pem).rsa_public_key()
        }
    }
}

enum PrivateOperation {
    SelfPadded { private_key: RsaPrivateKey },
    ExternalSigner { signer: std::sync::Arc<dyn Signer> },
}

fn resolve_private_operation(key_spec: &KeySpec) -> Result<(PrivateOperation, String)> {
    match key_spec {
        KeySpec::Signer(signer) => {
            let cert_pem = signer
                .certificate_pem()
                .ok_or_else(|| XmlSigError::KeyNotFound("signer nao possui certificado associado".into()))?;
            Ok((PrivateOperation::ExternalSigner { signer: signer.clone() }, cert_pem))
        }
        KeySpec::Path(path) => {
            let pem = std::fs::read_to_string(path).map_err(XmlSigError::Io)?;
            let private_key = PemKeyProvider::new(pem).rsa_private_key()?;
            Ok((PrivateOperation::SelfPadded { private_key }, String::new()))
        }
        KeySpec::Pem(pem) => {
            let private_key = PemKeyProvider::new(pem.clone()).rsa_private_key()?;
            Ok((PrivateOperation::SelfPadded { private_key }, String::new()))
        }
        KeySpec::Pkcs12 { der, password } => {
            let provider = Pkcs12KeyProvider::parse(der, password)?;
            let private_key = provider.rsa_private_key()?;
            let cert_pem = pem_encode_certificate(provider.certificate_der());
            Ok((PrivateOperation::SelfPadded { private_key }, cert_pem))
        }
        KeySpec::Fingerprint(fp) => Err(XmlSigError::KeyNotFound(format!(
            "fingerprint '{fp}' nao pode ser usado para assinar: nenhuma chave privada recuperavel"
        ))),
    }
}

fn pem_encode_certificate(der: &[u8]) -> String {
    format!("-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n", BASE64.encode(der))
}

fn pem_body_only(pem: &str) -> String {
    pem.lines().filter(|l| !l.starts_with("-----")).collect::<Vec<_>>().join("")
}

/// Assina o documento. Insere um template se nenhuma `<Signature>` existir
/// ainda; processa (e assina) todas as `<Signature>` presentes em seguida.
pub fn sign(doc: &mut Tree, key_spec: &KeySpec, opts: &SignOptions) -> Result<()> {
    let (operation, provider_cert_pem) = resolve_private_operation(key_spec)?;
    let cert_pem = opts
        .cert_pem
        .clone()
        .or_else(|| if provider_cert_pem.is_empty() { None } else { Some(provider_cert_pem) })
        .ok_or_else(|| XmlSigError::KeyNotFound("nenhum certificado disponivel para KeyInfo".into()))?;

    if doc.find_first_descendant(doc.root, Some(DSIG_NS), "Signature").is_none() {
        let signature = build_signature_template(doc, &opts.template);
        doc.insert_child_at(doc.root, 0, signature);
    }

    let signatures = doc.find_descendants(doc.root, Some(DSIG_NS), "Signature");
    for signature in signatures {
        let signed_info = doc
            .find_first_descendant(signature, Some(DSIG_NS), "SignedInfo")
            .ok_or_else(|| XmlSigError::MissingElement("SignedInfo".into()))?;

        process_references(doc, signed_info, &opts.id_attributes)?;

        let c14n_method = read_algorithm_attr(doc, signed_info, "CanonicalizationMethod")?;
        let exclusive = c14n_method.contains("exc-c14n");
        let with_comments = c14n_method.contains("WithComments");
        let c14n_bytes = crate::canon::canonicalize(doc, signed_info, exclusive, with_comments, &[])?;

        let sig_method = read_algorithm_attr(doc, signed_info, "SignatureMethod")?;
        let digest_uri = signature_method_to_digest_uri(&sig_method)?;
        let si_digest = digest_bytes(digest_uri, &c14n_bytes)?;

        let sig_bytes = match &operation {
            PrivateOperation::ExternalSigner { signer } => {
                // O signer externo faz o proprio padding PKCS#1 v1.5 (como um
                // modulo PKCS#11); ele ainda recebe o DigestInfo com o prefixo
                // ASN.1 ja embutido, nao o digest cru.
                let prefixed = build_digest_info(digest_uri, &si_digest)?;
                signer.sign_raw(&prefixed)?
            }
            PrivateOperation::SelfPadded { private_key } => {
                let key_size = private_key.size();
                let block = build_signed_block(digest_uri, &si_digest, key_size, true)?;
                rsa_raw(&block, private_key.d(), private_key.n(), key_size)
            }
        };
        let encoded = BASE64.encode(&sig_bytes);

        match doc.find_first_descendant(signature, Some(DSIG_NS), "SignatureValue") {
            Some(existing) => doc.set_text(existing, encoded),
            None => {
                append_signature_value(doc, signature, signed_info, &encoded);
            }
        }

        if doc.find_first_descendant(signature, Some(DSIG_NS), "KeyInfo").is_none() {
            let signature_value = doc
                .find_first_descendant(signature, Some(DSIG_NS), "SignatureValue")
                .expect("acabou de ser inserido");
            append_key_info(doc, signature_value, &pem_body_only(&cert_pem));
        }
        debug!("Signature em {signature} assinada com {digest_uri}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspec::KeySpec;

    #[test]
    fn verify_returns_false_on_document_without_signature() {
        let doc = Tree::parse("<Root/>").unwrap();
        let opts = VerifyOptions::default();
        let result = verify(&doc, &KeySpec::Pem(String::new()), &opts).unwrap();
        assert!(!result);
    }

    #[test]
    fn signature_method_uri_maps_to_digest() {
        assert_eq!(
            signature_method_to_digest_uri("http://www.w3.org/2000/09/xmldsig#rsa-sha1").unwrap(),
            DIGEST_SHA1
        );
        assert!(signature_method_to_digest_uri("urn:unknown").is_err());
    }
}
